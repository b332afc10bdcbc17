//! Static port mapping table.
//!
//! Each entry pairs an externally-listened port with the backend port it
//! forwards to. The table is validated once at startup and never changes.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a port mapping table
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortMapError {
    #[error("port mapping table is empty")]
    Empty,
    #[error("listen port {0} is mapped more than once")]
    DuplicateListenPort(u16),
    #[error("mapping {listen_port} -> {backend_port} uses port 0")]
    ZeroPort { listen_port: u16, backend_port: u16 },
}

/// A listen port and the backend port it relays to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Externally listened port (UDP and TCP)
    pub listen_port: u16,
    /// Backend port on the backend host
    pub backend_port: u16,
}

impl PortMapping {
    pub const fn new(listen_port: u16, backend_port: u16) -> Self {
        Self {
            listen_port,
            backend_port,
        }
    }
}

/// Primary mapping of the default table.
pub const PRIMARY_MAPPING: PortMapping = PortMapping::new(16261, 16300);
/// First listen port of the default sequential block.
pub const SEQUENTIAL_LISTEN_START: u16 = 16262;
/// First backend port of the default sequential block.
pub const SEQUENTIAL_BACKEND_START: u16 = 16301;
/// Number of ports in the default sequential block.
pub const SEQUENTIAL_BLOCK_LEN: u16 = 11;

/// Validated, immutable set of port mappings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingTable {
    mappings: Vec<PortMapping>,
}

impl PortMappingTable {
    /// Validate and build a table.
    ///
    /// Listen ports must be unique and no port may be 0.
    pub fn new(mappings: Vec<PortMapping>) -> Result<Self, PortMapError> {
        if mappings.is_empty() {
            return Err(PortMapError::Empty);
        }

        let mut seen = HashSet::with_capacity(mappings.len());
        for mapping in &mappings {
            if mapping.listen_port == 0 || mapping.backend_port == 0 {
                return Err(PortMapError::ZeroPort {
                    listen_port: mapping.listen_port,
                    backend_port: mapping.backend_port,
                });
            }
            if !seen.insert(mapping.listen_port) {
                return Err(PortMapError::DuplicateListenPort(mapping.listen_port));
            }
        }

        Ok(Self { mappings })
    }

    /// The stock layout: one primary port plus a contiguous block of
    /// eleven ports mapped onto a contiguous backend block.
    pub fn default_mappings() -> Vec<PortMapping> {
        std::iter::once(PRIMARY_MAPPING)
            .chain((0..SEQUENTIAL_BLOCK_LEN).map(|offset| {
                PortMapping::new(
                    SEQUENTIAL_LISTEN_START + offset,
                    SEQUENTIAL_BACKEND_START + offset,
                )
            }))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortMapping> {
        self.mappings.iter()
    }

    pub fn as_slice(&self) -> &[PortMapping] {
        &self.mappings
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl Default for PortMappingTable {
    fn default() -> Self {
        Self {
            mappings: Self::default_mappings(),
        }
    }
}

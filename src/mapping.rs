//! Subdomain to backend port mapping table
//! Built once from a `prefix:port[,prefix:port...]` string at startup

use crate::error::{Error, Result};
use std::collections::HashMap;
use tracing::info;

/// Key that selects the fallback route
pub const WILDCARD: &str = "*";

/// Immutable table of subdomain prefixes to local backend ports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    routes: HashMap<String, u16>,
    wildcard: Option<u16>,
}

impl MappingTable {
    /// Parse a mapping specification such as `*:3000,api:4000`.
    ///
    /// Entries are separated by `,` and surrounding whitespace is ignored.
    /// Each entry is split on its first `:`; the key `*` becomes the fallback.
    /// A later entry for the same key overrides an earlier one.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.trim().is_empty() {
            return Err(Error::config("What ports do you want to map to?"));
        }

        let mut table = Self::default();

        for entry in spec.split(',') {
            let entry = entry.trim();
            let (key, port) = Self::parse_entry(entry)?;

            if key == WILDCARD {
                info!("Mapping * to {}", port);
                table.wildcard = Some(port);
            } else {
                info!("Mapping {}.* to {}", key, port);
                table.routes.insert(key.to_string(), port);
            }
        }

        Ok(table)
    }

    fn parse_entry(entry: &str) -> Result<(&str, u16)> {
        let (key, port) = entry
            .split_once(':')
            .ok_or_else(|| Error::config(format!("entry {:?} is not in prefix:port form", entry)))?;

        let key = key.trim();
        if key.is_empty() {
            return Err(Error::config(format!("entry {:?} has an empty prefix", entry)));
        }

        let port = match port.trim().parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => {
                return Err(Error::config(format!(
                    "entry {:?} does not name a valid port",
                    entry
                )))
            }
        };

        Ok((key, port))
    }

    /// Port for an exact prefix match, falling back to the wildcard
    pub fn lookup(&self, subdomain: &str) -> Option<u16> {
        self.routes.get(subdomain).copied().or(self.wildcard)
    }

    /// Port of the `*` entry, if configured
    pub fn wildcard(&self) -> Option<u16> {
        self.wildcard
    }

    /// Number of configured entries, wildcard included
    pub fn len(&self) -> usize {
        self.routes.len() + usize::from(self.wildcard.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! IdP directory lookups (entity id -> institution id)
//!
//! Only used to label aggregated reports. Missing entries pass through as None.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub trait Directory: Send + Sync {
    fn institution_id(&self, idp_entity_id: &str) -> Option<String>;
}

pub type SharedDirectory = Arc<dyn Directory>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdpEntry {
    entity_id: String,
    #[serde(default)]
    institution_id: Option<String>,
}

/// Directory snapshot loaded from a JSON export
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    institutions: HashMap<String, String>,
}

impl StaticDirectory {
    /// Load the idp list if available; an absent or broken file gives an empty directory
    pub fn load(path: &str) -> Self {
        if path.is_empty() {
            info!("No IdP directory configured, institution labels disabled");
            return Self::default();
        }
        if !Path::new(path).exists() {
            warn!("IdP directory not found at {}, institution labels disabled", path);
            return Self::default();
        }

        match std::fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|raw| Self::from_json(&raw)) {
            Ok(directory) => {
                info!("Loaded {} IdP directory entries from {}", directory.institutions.len(), path);
                directory
            }
            Err(e) => {
                warn!("Failed to load IdP directory {}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, String> {
        let entries: Vec<IdpEntry> = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        let institutions = entries
            .into_iter()
            .filter_map(|e| {
                let institution = e.institution_id.filter(|i| !i.trim().is_empty())?;
                Some((e.entity_id, institution))
            })
            .collect();
        Ok(Self { institutions })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self { institutions: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

impl Directory for StaticDirectory {
    fn institution_id(&self, idp_entity_id: &str) -> Option<String> {
        self.institutions.get(idp_entity_id).cloned()
    }
}

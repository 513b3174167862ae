//! Image metadata labels. Informational only.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageLabels {
    pub name: String,
    pub version: String,
    pub description: String,
    pub repository: String,
    pub maintainer: String,
    /// Marketplace icon name
    pub icon: String,
    /// Marketplace color
    pub color: String,
}

impl Default for ImageLabels {
    fn default() -> Self {
        ImageLabels {
            name: "crossbox".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Build statically linked musl binaries".to_string(),
            repository: env!("CARGO_PKG_REPOSITORY").to_string(),
            maintainer: "crossbox contributors".to_string(),
            icon: "package".to_string(),
            color: "orange".to_string(),
        }
    }
}

impl ImageLabels {
    /// Label key/value pairs in rendering order. Empty values are omitted.
    pub fn pairs(&self) -> Vec<(&'static str, &str)> {
        [
            ("org.opencontainers.image.title", self.name.as_str()),
            ("org.opencontainers.image.version", self.version.as_str()),
            ("org.opencontainers.image.description", self.description.as_str()),
            ("org.opencontainers.image.source", self.repository.as_str()),
            ("org.opencontainers.image.authors", self.maintainer.as_str()),
            ("com.github.actions.name", self.name.as_str()),
            ("com.github.actions.description", self.description.as_str()),
            ("com.github.actions.icon", self.icon.as_str()),
            ("com.github.actions.color", self.color.as_str()),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_skip_empty() {
        let labels = ImageLabels {
            icon: String::new(),
            ..ImageLabels::default()
        };
        let pairs = labels.pairs();
        assert!(pairs.iter().all(|(k, _)| *k != "com.github.actions.icon"));
        assert!(pairs
            .iter()
            .any(|(k, v)| *k == "org.opencontainers.image.title" && *v == "crossbox"));
    }
}

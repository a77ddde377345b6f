//! Configuration loader

use crate::config::StasisConfig;
use crate::error::{Error, Result};
use std::path::Path;

/// Configuration loader for various formats
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    ///
    /// Relative root, manifest and manifest-root paths are resolved
    /// against the directory holding the configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<StasisConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let mut config = match ext {
            "json" => Self::from_json(&content)?,
            "toml" | "" => Self::from_toml(&content)?,
            _ => return Err(Error::Config(format!("Unknown config format: {}", ext))),
        };

        if let Some(base) = path.parent() {
            Self::rebase(&mut config, base);
        }
        tracing::debug!("📄 Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse JSON configuration
    pub fn from_json(content: &str) -> Result<StasisConfig> {
        serde_json::from_str(content).map_err(|e| Error::Config(format!("Invalid JSON: {}", e)))
    }

    /// Parse TOML configuration
    pub fn from_toml(content: &str) -> Result<StasisConfig> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    fn rebase(config: &mut StasisConfig, base: &Path) {
        for root in &mut config.roots {
            if root.path.is_relative() {
                root.path = base.join(&root.path);
            }
        }
        if let Some(manifest) = &mut config.manifest {
            if manifest.path.is_relative() {
                manifest.path = base.join(&manifest.path);
            }
            if let Some(root) = &mut manifest.root {
                if root.is_relative() {
                    *root = base.join(&*root);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionLevel, MultiRangePolicy};

    #[test]
    fn test_json_loading() {
        let json = r#"{"roots": []}"#;
        let config = ConfigLoader::from_json(json).unwrap();
        assert!(config.roots.is_empty());
        assert_eq!(config.compression.min_size, 200);
        assert_eq!(config.cache.max_age, Some(60));
        assert!(!config.serve.autorefresh);
        assert!(config.serve.headers.is_empty());
    }

    #[test]
    fn test_toml_loading() {
        let toml = r#"
            listen = "0.0.0.0:9000"

            [[roots]]
            path = "public"
            prefix = "/static/"

            [compression]
            encodings = ["gzip"]
            level = "best"

            [serve]
            multi_range = "multipart"
            index_file = "index.html"
            autorefresh = true

            [[serve.headers]]
            pattern = '\.woff2$'
            headers = { "X-Font" = "yes" }
        "#;
        let config = ConfigLoader::from_toml(toml).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.roots[0].prefix, "/static/");
        assert_eq!(config.compression.encodings, vec!["gzip"]);
        assert_eq!(config.compression.level, CompressionLevel::Best);
        assert_eq!(config.serve.multi_range, MultiRangePolicy::Multipart);
        assert_eq!(config.serve.index_file.as_deref(), Some("index.html"));
        assert!(config.serve.allow_all_origins);
        assert!(config.serve.autorefresh);
        assert_eq!(config.serve.headers[0].pattern, r"\.woff2$");
        assert_eq!(
            config.serve.headers[0].headers.get("X-Font").map(String::as_str),
            Some("yes")
        );
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            ConfigLoader::from_toml("roots = 5"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_rebases_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stasis.toml");
        std::fs::write(
            &path,
            "[[roots]]\npath = \"public\"\n\n[manifest]\npath = \"staticfiles.json\"\n",
        )
        .unwrap();

        let config = ConfigLoader::load(&path).unwrap();
        assert_eq!(config.roots[0].path, dir.path().join("public"));
        assert_eq!(
            config.manifest.unwrap().path,
            dir.path().join("staticfiles.json")
        );
    }

    #[test]
    fn test_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stasis.yaml");
        std::fs::write(&path, "roots: []").unwrap();
        assert!(ConfigLoader::load(&path).is_err());
    }
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::discover::Interaction;

const DEFAULT_CONFIG_FILE: &str = "form13f";
const ENV_PREFIX: &str = "FORM13F";
const DEFAULT_INDEX_URL: &str =
    "https://www.sec.gov/data-research/sec-markets-data/form-13f-data-sets";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub user_agent: String,
    pub http: HttpSettings,
    pub discovery: DiscoverySettings,
    pub retrieval: RetrievalSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub requests_per_second: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Static,
    #[serde(alias = "browser")]
    WebDriver,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub index_url: String,
    pub archive_extension: String,
    pub backend: Backend,
    pub webdriver_url: String,
    pub settle_ms: u64,
    pub interactions: Vec<Interaction>,
    pub sources: Vec<Source>,
}

/// One index page to discover archives on.
#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub archive_extension: Option<String>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub extensions: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("data"),
            db_path: PathBuf::from("data/form13f.sqlite"),
            user_agent: "form13f-loader admin@example.com".to_string(),
            http: HttpSettings::default(),
            discovery: DiscoverySettings::default(),
            retrieval: RetrievalSettings::default(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            timeout_secs: 30,
            max_retries: 3,
            base_backoff_ms: 1000,
            requests_per_second: 5,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            index_url: DEFAULT_INDEX_URL.to_string(),
            archive_extension: ".zip".to_string(),
            backend: Backend::Static,
            webdriver_url: "http://localhost:4444".to_string(),
            settle_ms: 2000,
            interactions: Vec::new(),
            sources: Vec::new(),
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        RetrievalSettings {
            extensions: vec![".tsv".into(), ".txt".into()],
            exclude_patterns: ["readme", "metadata", ".htm", ".html", ".json", ".pdf"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Settings {
    /// Defaults, then the optional TOML file, then `FORM13F_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let file = match path {
            Some(p) => File::from(p.to_path_buf()).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent must not be empty: upstream requires a declared client");
        }
        if self.http.requests_per_second == 0 {
            anyhow::bail!("http.requests_per_second must be at least 1");
        }
        Ok(())
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.data_dir.join("archives")
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.data_dir.join("extracted")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.data_dir.join("manifests")
    }

    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.manifests_dir().join(format!("{}.json", name))
    }

    /// Configured sources, or the single default index page.
    pub fn sources(&self) -> Vec<Source> {
        if !self.discovery.sources.is_empty() {
            return self.discovery.sources.clone();
        }
        vec![Source {
            name: "default".to_string(),
            url: self.discovery.index_url.clone(),
            archive_extension: None,
            interactions: self.discovery.interactions.clone(),
        }]
    }
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::Locator;

    #[test]
    fn defaults_without_file() {
        let s = Settings::default();
        assert_eq!(s.retrieval.extensions, vec![".tsv", ".txt"]);
        assert_eq!(s.discovery.archive_extension, ".zip");
        assert_eq!(s.staging_dir(), PathBuf::from("data/staging"));
        assert_eq!(s.sources().len(), 1);
    }

    #[test]
    fn reads_sources_and_interactions_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("form13f.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/tmp/f13"
user_agent = "Example Research research@example.com"

[http]
max_retries = 5

[[discovery.sources]]
name = "13f"
url = "https://example.com/13f"

[[discovery.sources.interactions]]
name = "expand years"

[[discovery.sources.interactions.strategies]]
by = "text"
value = "2024"
click_all = true

[[discovery.sources.interactions.strategies]]
by = "css"
value = "div.accordion-header"
"#,
        )
        .unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.data_dir, PathBuf::from("/tmp/f13"));
        assert_eq!(s.http.max_retries, 5);
        assert_eq!(s.http.timeout_secs, 30);

        let sources = s.sources();
        assert_eq!(sources.len(), 1);
        let strategies = &sources[0].interactions[0].strategies;
        assert_eq!(strategies.len(), 2);
        assert_eq!(strategies[0].locator, Locator::Text("2024".into()));
        assert!(strategies[0].click_all);
        assert_eq!(strategies[1].locator, Locator::Css("div.accordion-header".into()));
    }

    #[test]
    fn empty_user_agent_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "user_agent = \"  \"\n").unwrap();
        assert!(Settings::load(Some(&path)).is_err());
    }
}

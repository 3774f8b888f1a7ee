pub mod static_page;
#[cfg(feature = "webdriver")]
pub mod webdriver;

use std::collections::BTreeSet;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Backend, Settings, Source};
use crate::http::Fetcher;
use crate::manifest::{ArchiveLink, DiscoveryManifest, SourceResult, SourceStatus};

// ── Strategy model ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Case-insensitive match on an element's own text.
    Text(String),
    Class(String),
    Css(String),
    XPath(String),
    Id(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LocatorKind {
    Text,
    Class,
    Css,
    #[serde(alias = "x_path")]
    Xpath,
    Id,
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Text(v) => write!(f, "text '{}'", v),
            Locator::Class(v) => write!(f, "class '{}'", v),
            Locator::Css(v) => write!(f, "css '{}'", v),
            Locator::XPath(v) => write!(f, "xpath '{}'", v),
            Locator::Id(v) => write!(f, "id '{}'", v),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Click,
}

/// A locator plus the action to perform on whatever it finds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "StrategyConfig")]
pub struct Strategy {
    pub locator: Locator,
    pub action: Action,
    /// Act on every visible match instead of only the first.
    pub click_all: bool,
    pub description: Option<String>,
}

#[derive(Deserialize)]
struct StrategyConfig {
    by: LocatorKind,
    value: String,
    #[serde(default)]
    action: Action,
    #[serde(default)]
    click_all: bool,
    #[serde(default)]
    description: Option<String>,
}

impl From<StrategyConfig> for Strategy {
    fn from(cfg: StrategyConfig) -> Self {
        let locator = match cfg.by {
            LocatorKind::Text => Locator::Text(cfg.value),
            LocatorKind::Class => Locator::Class(cfg.value),
            LocatorKind::Css => Locator::Css(cfg.value),
            LocatorKind::Xpath => Locator::XPath(cfg.value),
            LocatorKind::Id => Locator::Id(cfg.value),
        };
        Strategy {
            locator,
            action: cfg.action,
            click_all: cfg.click_all,
            description: cfg.description,
        }
    }
}

impl Strategy {
    #[cfg(test)]
    pub fn click(locator: Locator) -> Self {
        Strategy {
            locator,
            action: Action::Click,
            click_all: false,
            description: None,
        }
    }

    pub fn label(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| self.locator.to_string())
    }
}

/// One point on the page that must be interacted with before links show up.
/// Strategies are tried in order and the first that lands wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Interaction {
    #[serde(default)]
    pub name: String,
    pub strategies: Vec<Strategy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionOutcome {
    pub name: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_index: Option<usize>,
    pub clicked: usize,
}

#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("no visible element matched {0}")]
    NotFound(String),
    #[error("element is not interactable: {0}")]
    NotInteractable(String),
    #[error("click failed: {0}")]
    ClickFailed(String),
    #[error("{0} is not supported by this backend")]
    Unsupported(String),
    #[error("invalid selector {0}")]
    InvalidSelector(String),
    #[cfg(feature = "webdriver")]
    #[error("driver error: {0}")]
    Driver(String),
}

// ── Page seam ──

/// A loaded index page that can be searched and clicked.
#[async_trait(?Send)]
pub trait Page {
    type Element;

    fn url(&self) -> &Url;

    async fn find(&mut self, locator: &Locator) -> Result<Vec<Self::Element>, InteractionError>;

    /// Displayed and enabled.
    async fn is_interactable(&mut self, element: &Self::Element) -> bool;

    /// Native click.
    async fn click(&mut self, element: &Self::Element) -> Result<(), InteractionError>;

    /// Programmatic click dispatched by the page itself.
    async fn script_click(&mut self, element: &Self::Element) -> Result<(), InteractionError>;

    /// Wait for content revealed by an interaction to render.
    async fn settle(&mut self);

    /// Raw `href` values of every anchor currently on the page.
    async fn anchor_hrefs(&mut self) -> Result<Vec<String>, InteractionError>;
}

/// Try each strategy in priority order until one clicks something.
pub async fn perform<P: Page>(page: &mut P, interaction: &Interaction) -> InteractionOutcome {
    let name = if interaction.name.is_empty() {
        "interaction".to_string()
    } else {
        interaction.name.clone()
    };

    for (idx, strategy) in interaction.strategies.iter().enumerate() {
        debug!("{}: trying strategy {} ({})", name, idx + 1, strategy.label());
        match apply(page, strategy).await {
            Ok(clicked) => {
                info!(
                    "{}: strategy {} ({}) clicked {} element(s)",
                    name,
                    idx + 1,
                    strategy.label(),
                    clicked
                );
                page.settle().await;
                return InteractionOutcome {
                    name,
                    succeeded: true,
                    strategy: Some(strategy.label()),
                    strategy_index: Some(idx),
                    clicked,
                };
            }
            Err(e) => debug!("{}: strategy {} failed: {}", name, idx + 1, e),
        }
    }

    warn!(
        "{}: all {} strategies failed, continuing with visible links",
        name,
        interaction.strategies.len()
    );
    InteractionOutcome {
        name,
        succeeded: false,
        strategy: None,
        strategy_index: None,
        clicked: 0,
    }
}

async fn apply<P: Page>(page: &mut P, strategy: &Strategy) -> Result<usize, InteractionError> {
    let found = page.find(&strategy.locator).await?;
    let mut visible = Vec::new();
    for element in found {
        if page.is_interactable(&element).await {
            visible.push(element);
        }
    }
    if visible.is_empty() {
        return Err(InteractionError::NotFound(strategy.locator.to_string()));
    }

    let targets = if strategy.click_all { &visible[..] } else { &visible[..1] };
    let mut clicked = 0;
    let mut last_err = None;
    for element in targets {
        let result = match strategy.action {
            Action::Click => click_with_fallback(page, element).await,
        };
        match result {
            Ok(()) => clicked += 1,
            Err(e) => last_err = Some(e),
        }
    }

    match (clicked, last_err) {
        (0, Some(e)) => Err(e),
        (0, None) => Err(InteractionError::NotInteractable(strategy.locator.to_string())),
        (n, _) => Ok(n),
    }
}

async fn click_with_fallback<P: Page>(
    page: &mut P,
    element: &P::Element,
) -> Result<(), InteractionError> {
    let native = match page.click(element).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    debug!("native click failed ({}), falling back to programmatic click", native);
    page.script_click(element)
        .await
        .map_err(|e| InteractionError::ClickFailed(format!("native: {}; programmatic: {}", native, e)))
}

// ── Link extraction ──

/// Resolve hrefs against the page URL and keep those whose path ends with
/// `extension`. Sorted and deduplicated.
pub fn archive_links(page_url: &Url, hrefs: &[String], extension: &str) -> Vec<String> {
    let ext = extension.to_lowercase();
    let urls: BTreeSet<String> = hrefs
        .iter()
        .filter_map(|href| page_url.join(href.trim()).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .filter(|u| u.path().to_lowercase().ends_with(&ext))
        .map(|mut u| {
            u.set_fragment(None);
            u.to_string()
        })
        .collect();
    urls.into_iter().collect()
}

pub fn archive_filename(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(|x| x.to_string()))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| url.rsplit('/').next().unwrap_or(url).to_string())
}

pub struct PageDiscovery {
    pub interactions: Vec<InteractionOutcome>,
    pub archives: Vec<String>,
}

/// Run every configured interaction, then collect archive links. Failed
/// interactions degrade to whatever is visible.
pub async fn discover_on<P: Page>(
    page: &mut P,
    interactions: &[Interaction],
    extension: &str,
) -> Result<PageDiscovery, InteractionError> {
    let mut outcomes = Vec::with_capacity(interactions.len());
    for interaction in interactions {
        outcomes.push(perform(page, interaction).await);
    }
    let hrefs = page.anchor_hrefs().await?;
    debug!("{} anchors on {}", hrefs.len(), page.url());
    let archives = archive_links(page.url(), &hrefs, extension);
    Ok(PageDiscovery {
        interactions: outcomes,
        archives,
    })
}

// ── Stage ──

pub async fn run(settings: &Settings, sources: &[Source], interact: bool) -> Result<DiscoveryManifest> {
    let fetcher = Fetcher::new(settings)?;
    let mut all = BTreeSet::new();
    let mut results = Vec::with_capacity(sources.len());

    for source in sources {
        let ext = source
            .archive_extension
            .clone()
            .unwrap_or_else(|| settings.discovery.archive_extension.clone());
        let interactions: &[Interaction] = if interact { &source.interactions } else { &[] };
        info!("Discovering {} archives on {} ({})", ext, source.url, source.name);

        match discover_source(settings, &fetcher, &source.url, interactions, &ext).await {
            Ok(found) => {
                info!("{}: {} archive link(s)", source.name, found.archives.len());
                results.push(SourceResult {
                    name: source.name.clone(),
                    index_url: source.url.clone(),
                    status: SourceStatus::Success,
                    error: None,
                    interactions: found.interactions,
                    archive_count: found.archives.len(),
                });
                all.extend(found.archives);
            }
            Err(e) => {
                warn!("{}: discovery failed: {:#}", source.name, e);
                results.push(SourceResult {
                    name: source.name.clone(),
                    index_url: source.url.clone(),
                    status: SourceStatus::Failed,
                    error: Some(format!("{:#}", e)),
                    interactions: Vec::new(),
                    archive_count: 0,
                });
            }
        }
    }

    let archives: Vec<ArchiveLink> = all
        .into_iter()
        .map(|url| ArchiveLink {
            filename: archive_filename(&url),
            url,
        })
        .collect();

    Ok(DiscoveryManifest {
        discovered_at: Utc::now(),
        archive_count: archives.len(),
        archives,
        sources: results,
    })
}

async fn discover_source(
    settings: &Settings,
    fetcher: &Fetcher,
    url: &str,
    interactions: &[Interaction],
    ext: &str,
) -> Result<PageDiscovery> {
    match settings.discovery.backend {
        Backend::Static => {
            let mut page = static_page::StaticPage::load(fetcher, url).await?;
            Ok(discover_on(&mut page, interactions, ext).await?)
        }
        #[cfg(feature = "webdriver")]
        Backend::WebDriver => {
            let mut page = webdriver::WebDriverPage::open(settings, url).await?;
            let found = discover_on(&mut page, interactions, ext).await;
            page.close().await;
            Ok(found?)
        }
        #[cfg(not(feature = "webdriver"))]
        Backend::WebDriver => {
            anyhow::bail!("webdriver backend requested but form13f was built without the `webdriver` feature")
        }
    }
}

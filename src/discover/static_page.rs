use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};

use super::{InteractionError, Locator, Page};
use crate::http::Fetcher;

static HIDDEN_STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)display\s*:\s*none|visibility\s*:\s*hidden").unwrap()
});
static ANY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("*").unwrap());
static ANCHORS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Snapshot of an element located in the fetched document.
#[derive(Debug, Clone)]
pub struct StaticElement {
    pub position: usize,
    pub tag: String,
    pub visible: bool,
    pub disabled: bool,
}

/// An index page fetched over plain HTTP. The whole document is already
/// present, so a click reveals nothing new; interactions only confirm that
/// the target exists and is not hidden.
pub struct StaticPage {
    url: Url,
    html: Html,
}

impl StaticPage {
    pub async fn load(fetcher: &Fetcher, url: &str) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("Invalid index URL {}", url))?;
        let body = fetcher.get_text(url).await?;
        info!("Fetched index page {} ({} bytes)", url, body.len());
        Ok(StaticPage::from_html(parsed, &body))
    }

    pub fn from_html(url: Url, body: &str) -> Self {
        StaticPage {
            url,
            html: Html::parse_document(body),
        }
    }

    fn locate(&self, locator: &Locator) -> Result<Vec<StaticElement>, InteractionError> {
        let selector = match locator {
            Locator::Text(needle) => return Ok(self.locate_text(needle)),
            Locator::XPath(_) => return Err(InteractionError::Unsupported(locator.to_string())),
            Locator::Css(css) => css.clone(),
            Locator::Class(class) => class
                .split_whitespace()
                .map(|c| format!(".{}", c))
                .collect::<String>(),
            Locator::Id(id) => format!("[id=\"{}\"]", id.replace('"', "\\\"")),
        };
        let selector = Selector::parse(&selector)
            .map_err(|e| InteractionError::InvalidSelector(format!("{}: {}", locator, e)))?;

        let wanted: Vec<_> = self.html.select(&selector).map(|e| e.id()).collect();
        Ok(self
            .html
            .select(&ANY)
            .enumerate()
            .filter(|(_, e)| wanted.contains(&e.id()))
            .map(|(position, e)| snapshot(position, e))
            .collect())
    }

    fn locate_text(&self, needle: &str) -> Vec<StaticElement> {
        let needle = needle.to_lowercase();
        self.html
            .select(&ANY)
            .enumerate()
            .filter(|(_, e)| own_text(e).to_lowercase().contains(&needle))
            .map(|(position, e)| snapshot(position, e))
            .collect()
    }

    fn element_exists(&self, element: &StaticElement) -> bool {
        self.html
            .select(&ANY)
            .nth(element.position)
            .is_some_and(|e| e.value().name() == element.tag)
    }
}

fn own_text(e: &ElementRef) -> String {
    e.children()
        .filter_map(|c| c.value().as_text())
        .map(|t| t.trim())
        .collect::<Vec<_>>()
        .join(" ")
}

fn snapshot(position: usize, e: ElementRef) -> StaticElement {
    let hidden = std::iter::once(e)
        .chain(e.ancestors().filter_map(ElementRef::wrap))
        .any(|node| {
            let v = node.value();
            v.attr("hidden").is_some()
                || v.attr("aria-hidden").is_some_and(|a| a.eq_ignore_ascii_case("true"))
                || v.attr("style").is_some_and(|s| HIDDEN_STYLE_RE.is_match(s))
        });
    StaticElement {
        position,
        tag: e.value().name().to_string(),
        visible: !hidden,
        disabled: e.value().attr("disabled").is_some(),
    }
}

#[async_trait(?Send)]
impl Page for StaticPage {
    type Element = StaticElement;

    fn url(&self) -> &Url {
        &self.url
    }

    async fn find(&mut self, locator: &Locator) -> Result<Vec<StaticElement>, InteractionError> {
        let found = self.locate(locator)?;
        debug!("{} matched {} element(s)", locator, found.len());
        Ok(found)
    }

    async fn is_interactable(&mut self, element: &StaticElement) -> bool {
        element.visible && !element.disabled
    }

    async fn click(&mut self, element: &StaticElement) -> Result<(), InteractionError> {
        if !element.visible || element.disabled {
            return Err(InteractionError::NotInteractable(format!("<{}>", element.tag)));
        }
        Ok(())
    }

    async fn script_click(&mut self, element: &StaticElement) -> Result<(), InteractionError> {
        if self.element_exists(element) {
            Ok(())
        } else {
            Err(InteractionError::ClickFailed(format!("<{}> is gone", element.tag)))
        }
    }

    async fn settle(&mut self) {}

    async fn anchor_hrefs(&mut self) -> Result<Vec<String>, InteractionError> {
        Ok(self
            .html
            .select(&ANCHORS)
            .filter_map(|a| a.value().attr("href"))
            .map(|h| h.to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::{discover_on, Interaction, Strategy};

    const INDEX: &str = r#"
<html><body>
  <div class="accordion">
    <h3 class="accordion-header" id="y2024">2024 Data Sets</h3>
    <div class="panel" style="display: none">
      <a href="/files/structureddata/data/form-13f-data-sets/01dec2024-28feb2025_form13f.zip">Dec 2024 - Feb 2025</a>
      <a href="/files/structureddata/data/form-13f-data-sets/01sep2024-30nov2024_form13f.zip">Sep - Nov 2024</a>
    </div>
    <h3 class="accordion-header" hidden>Archived</h3>
    <button disabled>Download all</button>
  </div>
  <a href="/files/form13f_readme.pdf">Readme</a>
  <a href="https://www.sec.gov/files/structureddata/data/form-13f-data-sets/01sep2024-30nov2024_form13f.zip">dup</a>
</body></html>
"#;

    fn page() -> StaticPage {
        let url = Url::parse("https://www.sec.gov/data-research/sec-markets-data/form-13f-data-sets").unwrap();
        StaticPage::from_html(url, INDEX)
    }

    #[tokio::test]
    async fn text_match_is_case_insensitive_on_own_text() {
        let mut p = page();
        let found = p.find(&Locator::Text("2024 data SETS".into())).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tag, "h3");
        assert!(found[0].visible);
    }

    #[tokio::test]
    async fn class_and_id_locators() {
        let mut p = page();
        let by_class = p.find(&Locator::Class("accordion-header".into())).await.unwrap();
        assert_eq!(by_class.len(), 2);
        assert!(by_class[0].visible);
        assert!(!by_class[1].visible);

        let by_id = p.find(&Locator::Id("y2024".into())).await.unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].position, by_class[0].position);
    }

    #[tokio::test]
    async fn hidden_ancestor_hides_element() {
        let mut p = page();
        let links = p.find(&Locator::Css("div.panel a".into())).await.unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| !l.visible));
    }

    #[tokio::test]
    async fn disabled_element_is_not_interactable() {
        let mut p = page();
        let buttons = p.find(&Locator::Css("button".into())).await.unwrap();
        assert!(!p.is_interactable(&buttons[0]).await);
        assert!(p.click(&buttons[0]).await.is_err());
        assert!(p.script_click(&buttons[0]).await.is_ok());
    }

    #[tokio::test]
    async fn xpath_is_unsupported() {
        let mut p = page();
        let err = p.find(&Locator::XPath("//h3".into())).await.unwrap_err();
        assert!(matches!(err, InteractionError::Unsupported(_)));
    }

    #[tokio::test]
    async fn discovers_links_even_inside_collapsed_panels() {
        let mut p = page();
        let interactions = vec![Interaction {
            name: "expand 2024".into(),
            strategies: vec![
                Strategy::click(Locator::XPath("//h3[1]".into())),
                Strategy::click(Locator::Text("2024 Data Sets".into())),
            ],
        }];
        let found = discover_on(&mut p, &interactions, ".zip").await.unwrap();
        assert!(found.interactions[0].succeeded);
        assert_eq!(found.interactions[0].strategy_index, Some(1));
        assert_eq!(found.archives.len(), 2);
        assert!(found.archives[0].ends_with("01dec2024-28feb2025_form13f.zip"));
    }
}

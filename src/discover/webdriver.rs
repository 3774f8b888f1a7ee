use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fantoccini::elements::Element;
use fantoccini::{Client, ClientBuilder, Locator as By};
use reqwest::Url;
use tracing::{debug, info, warn};

use super::{InteractionError, Locator, Page};
use crate::config::Settings;

/// A page driven through a WebDriver endpoint, for index pages that only
/// render their archive links after script-driven interactions.
pub struct WebDriverPage {
    client: Client,
    url: Url,
    settle: Duration,
}

impl WebDriverPage {
    pub async fn open(settings: &Settings, url: &str) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("Invalid index URL {}", url))?;
        let mut caps = serde_json::map::Map::new();
        caps.insert(
            "goog:chromeOptions".to_string(),
            serde_json::json!({
                "args": ["--headless=new", format!("--user-agent={}", settings.user_agent)]
            }),
        );
        let client = ClientBuilder::native()
            .capabilities(caps)
            .connect(&settings.discovery.webdriver_url)
            .await
            .with_context(|| format!("Failed to reach WebDriver at {}", settings.discovery.webdriver_url))?;

        info!("Loading {} via WebDriver", url);
        client.goto(url).await.context("WebDriver navigation failed")?;
        let settle = Duration::from_millis(settings.discovery.settle_ms);
        if let Err(e) = client
            .wait()
            .at_most(Duration::from_secs(settings.http.timeout_secs))
            .for_element(By::Css("a"))
            .await
        {
            warn!("No anchors appeared on {} before timeout: {}", url, e);
        }
        tokio::time::sleep(settle).await;

        Ok(WebDriverPage {
            client,
            url: parsed,
            settle,
        })
    }

    pub async fn close(self) {
        if let Err(e) = self.client.close().await {
            debug!("WebDriver session close failed: {}", e);
        }
    }
}

fn driver_err(e: impl std::fmt::Display) -> InteractionError {
    InteractionError::Driver(e.to_string())
}

fn text_xpath(needle: &str) -> String {
    let lower = needle.to_lowercase().replace('\'', "");
    format!(
        "//*[contains(translate(text(), 'ABCDEFGHIJKLMNOPQRSTUVWXYZ', 'abcdefghijklmnopqrstuvwxyz'), '{}')]",
        lower
    )
}

#[async_trait(?Send)]
impl Page for WebDriverPage {
    type Element = Element;

    fn url(&self) -> &Url {
        &self.url
    }

    async fn find(&mut self, locator: &Locator) -> Result<Vec<Element>, InteractionError> {
        let found = match locator {
            Locator::Text(t) => {
                let xpath = text_xpath(t);
                self.client.find_all(By::XPath(&xpath)).await
            }
            Locator::Class(c) => {
                let css = c
                    .split_whitespace()
                    .map(|c| format!(".{}", c))
                    .collect::<String>();
                self.client.find_all(By::Css(&css)).await
            }
            Locator::Css(css) => self.client.find_all(By::Css(css)).await,
            Locator::XPath(xpath) => self.client.find_all(By::XPath(xpath)).await,
            Locator::Id(id) => self.client.find_all(By::Id(id)).await,
        };
        found.map_err(driver_err)
    }

    async fn is_interactable(&mut self, element: &Element) -> bool {
        let displayed = element.is_displayed().await.unwrap_or(false);
        let enabled = element.is_enabled().await.unwrap_or(false);
        displayed && enabled
    }

    async fn click(&mut self, element: &Element) -> Result<(), InteractionError> {
        let arg = serde_json::to_value(element).map_err(driver_err)?;
        if let Err(e) = self
            .client
            .execute("arguments[0].scrollIntoView({block: 'center'});", vec![arg])
            .await
        {
            debug!("scrollIntoView failed, clicking in place: {}", e);
        }
        element
            .click()
            .await
            .map_err(|e| InteractionError::NotInteractable(e.to_string()))
    }

    async fn script_click(&mut self, element: &Element) -> Result<(), InteractionError> {
        let arg = serde_json::to_value(element).map_err(driver_err)?;
        self.client
            .execute("arguments[0].click();", vec![arg])
            .await
            .map(|_| ())
            .map_err(|e| InteractionError::ClickFailed(e.to_string()))
    }

    async fn settle(&mut self) {
        tokio::time::sleep(self.settle).await;
    }

    async fn anchor_hrefs(&mut self) -> Result<Vec<String>, InteractionError> {
        let anchors = self.client.find_all(By::Css("a[href]")).await.map_err(driver_err)?;
        let mut hrefs = Vec::with_capacity(anchors.len());
        for a in anchors {
            match a.attr("href").await {
                Ok(Some(href)) => hrefs.push(href),
                Ok(None) => {}
                Err(e) => debug!("skipping stale anchor: {}", e),
            }
        }
        Ok(hrefs)
    }
}

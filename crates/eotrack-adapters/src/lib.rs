//! Listing/detail scraper adapters for presidential-action pages.

use std::sync::LazyLock;

use async_trait::async_trait;
use eotrack_core::{Record, NO_CONTENT_FOUND, NO_DATE, NO_LINK, NO_TITLE};
use eotrack_storage::{FetchError, HttpClientConfig, HttpFetcher, RetryDisposition};
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "eotrack-adapters";

pub const WHITEHOUSE_ACTIONS_URL: &str = "https://www.whitehouse.gov/presidential-actions/";

const ITEM_SELECTORS: [&str; 4] = ["article.news-item", ".news-item", "article", ".post"];
const TITLE_SELECTORS: [&str; 4] = [".news-item__title", "h2 a", "h3 a", ".entry-title a"];
const DATE_SELECTORS: [&str; 3] = [".news-item__date", ".entry-date", "time"];
const CONTENT_AREA_SELECTORS: [&str; 4] = ["main#main-content", ".entry-content", ".post-content", "article"];

static PAGE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/page/(\d+)").expect("valid page regex"));
static WP_INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"index-(\d+)").expect("valid index regex"));

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// Throttling, 5xx and transport hiccups are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Fetch(err) => err.disposition() == RetryDisposition::Retryable,
            _ => false,
        }
    }
}

/// Supplies raw listing records and detail-page content. Owns all HTML knowledge.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn detect_total_pages(&self) -> usize;

    async fn fetch_listing(&self, page: usize) -> Result<Vec<Record>, AdapterError>;

    /// Paragraph text of the detail page, or [`NO_CONTENT_FOUND`] when it has none.
    async fn fetch_detail(&self, link: &str) -> Result<String, AdapterError>;
}

pub struct WhiteHouseAdapter {
    http: HttpFetcher,
    base_url: String,
}

impl WhiteHouseAdapter {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
            base_url: WHITEHOUSE_ACTIONS_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = base_url;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn listing_url(&self, page: usize) -> String {
        listing_url(&self.base_url, page)
    }
}

pub fn listing_url(base_url: &str, page: usize) -> String {
    if page > 1 {
        format!("{base_url}page/{page}/")
    } else {
        base_url.to_string()
    }
}

#[async_trait]
impl ListingSource for WhiteHouseAdapter {
    fn source_id(&self) -> &'static str {
        "whitehouse"
    }

    async fn detect_total_pages(&self) -> usize {
        match self.http.fetch_bytes(&self.base_url).await {
            Ok(resp) => {
                let pages = detect_total_pages_html(&resp.text()).unwrap_or(1);
                info!(pages, "detected listing pages");
                pages
            }
            Err(err) => {
                warn!(error = %err, "could not detect total pages; defaulting to 1");
                1
            }
        }
    }

    async fn fetch_listing(&self, page: usize) -> Result<Vec<Record>, AdapterError> {
        let url = self.listing_url(page);
        debug!(page, url, "fetching listing page");
        let resp = self.http.fetch_bytes(&url).await?;
        parse_listing_html(&resp.text(), &resp.final_url, page)
    }

    async fn fetch_detail(&self, link: &str) -> Result<String, AdapterError> {
        let resp = self.http.fetch_once(link).await?;
        Ok(extract_detail_content(&resp.text()))
    }
}

fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Message(format!("invalid selector {raw}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<String>()
}

fn select_first_of<'a>(
    scope: &ElementRef<'a>,
    selectors: &[&str],
) -> Result<Option<ElementRef<'a>>, AdapterError> {
    for raw in selectors {
        if let Some(found) = scope.select(&selector(raw)?).next() {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

fn href_of(el: &ElementRef<'_>) -> Result<Option<String>, AdapterError> {
    if let Some(href) = el.value().attr("href").and_then(|h| text_or_none(h.to_string())) {
        return Ok(Some(href));
    }
    Ok(el
        .select(&selector("a[href]")?)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|h| text_or_none(h.to_string())))
}

fn resolve_link(page_url: &str, href: &str) -> String {
    match Url::parse(page_url).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

/// Extract listing records from one listing page, trying the known item layouts in order.
pub fn parse_listing_html(html: &str, page_url: &str, page: usize) -> Result<Vec<Record>, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut items = Vec::new();
    for raw in ITEM_SELECTORS {
        items = root.select(&selector(raw)?).collect::<Vec<_>>();
        if !items.is_empty() {
            break;
        }
    }

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        let title_el = select_first_of(&item, &TITLE_SELECTORS)?;
        let date_el = select_first_of(&item, &DATE_SELECTORS)?;

        let title = title_el
            .as_ref()
            .and_then(|el| text_or_none(element_text(el)))
            .unwrap_or_else(|| NO_TITLE.to_string());
        let link = match title_el.as_ref() {
            Some(el) => href_of(el)?.map(|href| resolve_link(page_url, &href)),
            None => None,
        }
        .unwrap_or_else(|| NO_LINK.to_string());
        let date = date_el
            .as_ref()
            .and_then(|el| text_or_none(element_text(el)))
            .unwrap_or_else(|| NO_DATE.to_string());

        let mut record = Record::new(title, link, date);
        record.page_number = Some(page.to_string());
        records.push(record);
    }
    Ok(records)
}

/// Paragraph text from the main content area, joined by newlines.
pub fn extract_detail_content(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let paragraph = Selector::parse("p").expect("static selector");

    let area = CONTENT_AREA_SELECTORS
        .iter()
        .filter_map(|raw| Selector::parse(raw).ok())
        .find_map(|sel| root.select(&sel).next());

    let paragraphs: Vec<String> = match area {
        Some(area) => area
            .select(&paragraph)
            .filter_map(|p| text_or_none(element_text(&p)))
            .collect(),
        None => root
            .select(&paragraph)
            .filter_map(|p| text_or_none(element_text(&p)))
            .collect(),
    };

    if paragraphs.is_empty() {
        NO_CONTENT_FOUND.to_string()
    } else {
        paragraphs.join("\n")
    }
}

fn page_from_href(href: &str) -> Option<usize> {
    PAGE_PATH_RE
        .captures(href)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn index_from_key(key: &str) -> Option<usize> {
    WP_INDEX_RE
        .captures(key)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Highest listing page advertised by the block-editor pagination, if any.
pub fn detect_total_pages_html(html: &str) -> Option<usize> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let sel = |raw: &str| Selector::parse(raw).ok();

    if let Some(nav) = sel("nav.wp-block-query-pagination").and_then(|s| root.select(&s).next()) {
        let numbered = sel(r#"a[data-wp-key^="index-"]"#)?;
        let pages = nav
            .select(&numbered)
            .filter_map(|link| {
                if let Some(page) = link.value().attr("href").and_then(page_from_href) {
                    return Some(page);
                }
                let text = element_text(&link);
                if let Ok(page) = text.trim().parse::<usize>() {
                    return Some(page);
                }
                link.value()
                    .attr("data-wp-key")
                    .and_then(index_from_key)
                    .map(|i| i + 1)
            })
            .collect::<Vec<_>>();
        if let Some(max) = pages.into_iter().max() {
            return Some(max);
        }

        let next = sel(r#"a[data-wp-key="query-pagination-next"]"#)?;
        if let Some(page) = nav
            .select(&next)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(page_from_href)
        {
            return Some(page);
        }
    }

    let anchors = sel("a[href]")?;
    if let Some(max) = root
        .select(&anchors)
        .filter_map(|a| a.value().attr("href").and_then(page_from_href))
        .max()
    {
        return Some(max);
    }

    let indexed = sel(r#"[data-wp-key^="index-"]"#)?;
    root.select(&indexed)
        .filter_map(|el| el.value().attr("data-wp-key").and_then(index_from_key))
        .max()
        .map(|i| i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(name: &str) -> String {
        let path = workspace_root().join("fixtures").join("whitehouse").join(name);
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    #[test]
    fn listing_page_extracts_title_link_date_and_page() {
        let records =
            parse_listing_html(&fixture("listing_page1.html"), WHITEHOUSE_ACTIONS_URL, 1).unwrap();
        assert_eq!(records.len(), 3);

        let first = &records[0];
        assert_eq!(first.title.as_deref(), Some("Restoring Equality of Opportunity and Meritocracy"));
        assert_eq!(
            first.link.as_deref(),
            Some("https://www.whitehouse.gov/presidential-actions/2025/04/restoring-equality-of-opportunity/")
        );
        assert_eq!(first.date.as_deref(), Some("April 23, 2025"));
        assert_eq!(first.page_number.as_deref(), Some("1"));
        assert!(first.content.is_none());

        assert_eq!(
            records[1].title.as_deref(),
            Some("Unleashing America\u{2019}s Offshore Critical Minerals and Resources")
        );
    }

    #[test]
    fn listing_item_without_anchor_gets_placeholders() {
        let records =
            parse_listing_html(&fixture("listing_page1.html"), WHITEHOUSE_ACTIONS_URL, 1).unwrap();
        let third = &records[2];
        assert_eq!(third.title.as_deref(), Some("Proclamation Without A Link"));
        assert_eq!(third.link.as_deref(), Some(NO_LINK));
        assert_eq!(third.date.as_deref(), Some(NO_DATE));
    }

    #[test]
    fn listing_falls_back_to_older_layouts_and_resolves_relative_links() {
        let records =
            parse_listing_html(&fixture("listing_fallback.html"), WHITEHOUSE_ACTIONS_URL, 4).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title.as_deref(), Some("Fact Sheet: Older Layout"));
        assert_eq!(
            records[0].link.as_deref(),
            Some("https://www.whitehouse.gov/briefings-statements/2025/02/fact-sheet/")
        );
        assert_eq!(records[0].date.as_deref(), Some("February 3, 2025"));
        assert_eq!(records[1].date.as_deref(), Some(NO_DATE));
        assert_eq!(records[1].page_number.as_deref(), Some("4"));
    }

    #[test]
    fn empty_listing_page_has_no_items() {
        let records =
            parse_listing_html(&fixture("listing_empty.html"), WHITEHOUSE_ACTIONS_URL, 9).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn detail_content_uses_main_area_paragraphs_only() {
        let content = extract_detail_content(&fixture("detail.html"));
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("By the authority vested in me"));
        assert!(lines[2].starts_with("Sec. 2. Policy."));
        assert!(!content.contains("Footer"));
        assert!(!content.contains("navigation"));
    }

    #[test]
    fn detail_without_paragraphs_reports_no_content() {
        assert_eq!(
            extract_detail_content(&fixture("detail_no_paragraphs.html")),
            NO_CONTENT_FOUND
        );
        assert_eq!(extract_detail_content("<html><body></body></html>"), NO_CONTENT_FOUND);
    }

    #[test]
    fn pagination_prefers_block_editor_numbers() {
        assert_eq!(detect_total_pages_html(&fixture("listing_page1.html")), Some(37));
    }

    #[test]
    fn pagination_falls_back_to_any_page_link_then_index_keys() {
        assert_eq!(detect_total_pages_html(&fixture("listing_fallback.html")), Some(4));
        let only_keys = r#"<div><span data-wp-key="index-0">1</span><span data-wp-key="index-5">6</span></div>"#;
        assert_eq!(detect_total_pages_html(only_keys), Some(6));
        assert_eq!(detect_total_pages_html(&fixture("listing_empty.html")), None);
    }

    #[test]
    fn listing_url_uses_page_suffix_after_first_page() {
        assert_eq!(listing_url(WHITEHOUSE_ACTIONS_URL, 1), WHITEHOUSE_ACTIONS_URL);
        assert_eq!(
            listing_url(WHITEHOUSE_ACTIONS_URL, 3),
            "https://www.whitehouse.gov/presidential-actions/page/3/"
        );
    }
}

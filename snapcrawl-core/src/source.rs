//! Candidate URL sources.
//!
//! A source is a lazy stream of URL strings; the pipeline decides how much
//! of it to consume.

use futures::stream::{self, BoxStream, StreamExt};

use crate::config::ImageConfig;

/// Lazy, possibly infinite sequence of candidate image URLs.
pub type UrlSource = BoxStream<'static, String>;

/// Stream over a fixed list of URLs, in order.
pub fn list_source<I>(urls: I) -> UrlSource
where
    I: IntoIterator<Item = String>,
    I::IntoIter: Send + 'static,
{
    stream::iter(urls).boxed()
}

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".gif", ".bmp", ".tiff"];

/// URL-level filters applied to every extracted candidate.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    extensions: Vec<String>,
    watermark_keywords: Vec<String>,
}

impl CandidateFilter {
    pub fn from_config(image: &ImageConfig) -> Self {
        let watermark_keywords = if image.skip_watermarked_urls {
            image
                .watermark_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect()
        } else {
            Vec::new()
        };
        Self {
            extensions: image.extensions.iter().map(|e| e.to_lowercase()).collect(),
            watermark_keywords,
        }
    }

    pub fn is_watermarked(&self, url: &str) -> bool {
        let lower = url.to_lowercase();
        self.watermark_keywords.iter().any(|k| lower.contains(k.as_str()))
    }

    pub fn passes_extension(&self, url: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let path = url_path(url);
        self.extensions.iter().any(|ext| path.ends_with(ext.as_str()))
    }

    pub fn accepts(&self, url: &str) -> bool {
        !self.is_watermarked(url) && self.passes_extension(url)
    }
}

fn url_path(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_lowercase(),
        Err(_) => url.to_lowercase(),
    }
}

/// Whether `url` points straight at an image file rather than a page.
pub fn looks_like_image_url(url: &str) -> bool {
    let path = url_path(url);
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Parse a `srcset` attribute, largest width descriptor first.
fn srcset_candidates(srcset: &str) -> Vec<&str> {
    let mut pairs: Vec<(u32, &str)> = srcset
        .split(',')
        .filter_map(|part| {
            let mut tokens = part.split_whitespace();
            let url = tokens.next()?;
            let width = tokens
                .next()
                .and_then(|d| d.strip_suffix('w'))
                .and_then(|w| w.parse().ok())
                .unwrap_or(0);
            Some((width, url))
        })
        .collect();
    // Stable sort keeps document order among equal widths.
    pairs.sort_by(|a, b| b.0.cmp(&a.0));
    pairs.into_iter().map(|(_, url)| url).collect()
}

#[cfg(feature = "network")]
pub use page::PageSource;

#[cfg(feature = "network")]
mod page {
    use std::collections::HashSet;
    use std::time::Duration;

    use futures::stream::{self, StreamExt};
    use reqwest::header::USER_AGENT;
    use reqwest::Client;
    use scraper::{Html, Selector};
    use tracing::{debug, info, warn};
    use url::Url;

    use super::{looks_like_image_url, srcset_candidates, CandidateFilter, UrlSource};
    use crate::config::{DownloadConfig, ImageConfig};
    use crate::error::{CrawlError, Result};

    /// Reads the configured seed pages and yields the `<img>` candidates on them.
    ///
    /// Seeds that are already image URLs are passed through. Only the seed
    /// pages themselves are read; links are not followed.
    #[derive(Clone)]
    pub struct PageSource {
        client: Client,
        seeds: Vec<String>,
        user_agent: Option<String>,
        timeout: Duration,
        filter: CandidateFilter,
        img: Selector,
    }

    impl PageSource {
        pub fn new(download: &DownloadConfig, image: &ImageConfig) -> Result<Self> {
            let client = Client::builder()
                .build()
                .map_err(|e| CrawlError::Config(format!("Failed to create HTTP client: {e}")))?;
            let img = Selector::parse("img")
                .map_err(|e| CrawlError::Config(format!("Invalid img selector: {e}")))?;
            Ok(Self {
                client,
                seeds: download.sources.clone(),
                user_agent: download.user_agents.first().cloned(),
                timeout: download.fetch_timeout(),
                filter: CandidateFilter::from_config(image),
                img,
            })
        }

        /// Image URLs found in `html`, resolved against `base`, in document order.
        pub fn extract(&self, html: &str, base: &Url) -> Vec<String> {
            let document = Html::parse_document(html);
            let mut found = Vec::new();
            for element in document.select(&self.img) {
                let attrs = element.value();
                let srcset = attrs.attr("srcset").or_else(|| attrs.attr("data-srcset"));
                let from_srcset = srcset.map(srcset_candidates).unwrap_or_default();
                let fallbacks = ["data-original", "data-src", "src"]
                    .into_iter()
                    .filter_map(|name| attrs.attr(name));

                for raw in from_srcset.into_iter().chain(fallbacks) {
                    let raw = raw.trim();
                    if raw.is_empty() || raw.starts_with("data:") {
                        continue;
                    }
                    let Ok(resolved) = base.join(raw) else {
                        continue;
                    };
                    let resolved = resolved.to_string();
                    if self.filter.accepts(&resolved) {
                        found.push(resolved);
                    }
                }
            }
            found
        }

        async fn fetch_page(&self, page: &str) -> Vec<String> {
            if looks_like_image_url(page) {
                return if self.filter.is_watermarked(page) {
                    Vec::new()
                } else {
                    vec![page.to_string()]
                };
            }
            let Ok(base) = Url::parse(page) else {
                warn!(seed = %page, "Skipping unparseable seed URL");
                return Vec::new();
            };

            let mut request = self.client.get(page).timeout(self.timeout);
            if let Some(agent) = &self.user_agent {
                request = request.header(USER_AGENT, agent);
            }
            let html = match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => match response.text().await {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(seed = %page, error = %e, "Failed to read page body");
                        return Vec::new();
                    }
                },
                Err(e) => {
                    debug!(seed = %page, error = %e, "Failed to load page");
                    return Vec::new();
                }
            };

            let found = self.extract(&html, &base);
            info!(seed = %page, candidates = found.len(), "Parsed seed page");
            found
        }

        /// Stream candidates page by page; each URL is yielded at most once.
        pub fn into_stream(self) -> UrlSource {
            let seeds = self.seeds.clone();
            let mut seen = HashSet::new();
            stream::iter(seeds)
                .then(move |seed| {
                    let source = self.clone();
                    async move { source.fetch_page(&seed).await }
                })
                .flat_map(stream::iter)
                .filter(move |url| {
                    let fresh = seen.insert(url.clone());
                    async move { fresh }
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srcset_largest_first() {
        let urls = srcset_candidates("small.jpg 320w, large.jpg 1280w, medium.jpg 640w");
        assert_eq!(urls, vec!["large.jpg", "medium.jpg", "small.jpg"]);
        assert_eq!(srcset_candidates("a.jpg 2x, b.jpg"), vec!["a.jpg", "b.jpg"]);
        assert!(srcset_candidates("").is_empty());
    }

    #[test]
    fn test_candidate_filter() {
        let filter = CandidateFilter::from_config(&ImageConfig::default());
        assert!(filter.accepts("https://example.com/photos/beach.JPG"));
        assert!(filter.accepts("https://example.com/a.png?size=large"));
        assert!(!filter.accepts("https://example.com/a.gif"));
        assert!(!filter.accepts("https://example.com/watermark/a.jpg"));
        assert!(!filter.accepts("https://example.com/thumbs/a.jpg"));
    }

    #[test]
    fn test_filter_keywords_disabled() {
        let image = ImageConfig {
            skip_watermarked_urls: false,
            extensions: Vec::new(),
            ..ImageConfig::default()
        };
        let filter = CandidateFilter::from_config(&image);
        assert!(filter.accepts("https://example.com/preview/a.gif"));
    }

    #[test]
    fn test_looks_like_image_url() {
        assert!(looks_like_image_url("https://cdn.example.com/x/y.webp"));
        assert!(!looks_like_image_url("https://example.com/gallery"));
    }

    #[tokio::test]
    async fn test_list_source_preserves_order() {
        let urls = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let collected: Vec<String> = list_source(urls.clone()).collect().await;
        assert_eq!(collected, urls);
    }

    #[cfg(feature = "network")]
    #[test]
    fn test_page_extraction() {
        use crate::config::DownloadConfig;

        let html = r#"
            <html><body>
              <img srcset="/img/s.jpg 320w, /img/l.jpg 1280w" src="/img/s.jpg">
              <img data-original="https://cdn.example.com/orig.png">
              <img src="data:image/png;base64,AAAA">
              <img src="/img/preview-1.jpg">
              <img src="/icons/logo.svg">
            </body></html>
        "#;
        let source = PageSource::new(&DownloadConfig::default(), &ImageConfig::default()).unwrap();
        let base = url::Url::parse("https://example.com/gallery/").unwrap();
        let found = source.extract(html, &base);
        assert_eq!(
            found,
            vec![
                "https://example.com/img/l.jpg",
                "https://example.com/img/s.jpg",
                "https://example.com/img/s.jpg",
                "https://cdn.example.com/orig.png",
            ]
        );
    }
}

//! Pulls seed, detail, comment and recommendation fields out of page markup.
//!
//! Every method is infallible: a missing field becomes a documented default and a
//! malformed card is dropped. Only selector compilation can fail, once, in [`Extractor::new`].

use hotreel_core::{Comment, ItemDetail, RelatedItem, SeedItem, DEFAULT_POSTER_URL};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

/// Comments kept per item, in page order.
pub const COMMENT_LIMIT: usize = 10;
/// Related items kept per primary item.
pub const RELATED_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid base url {url}: {reason}")]
    BaseUrl { url: String, reason: String },
}

fn compile(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug)]
pub struct Extractor {
    base: Url,
    anchor: Selector,
    seed_card: Selector,
    seed_title: Selector,
    seed_poster: Selector,
    detail_root: Selector,
    score_label: Selector,
    score_count: Selector,
    description: Selector,
    cast_name: Selector,
    comment_block: Selector,
    avatar: Selector,
    nickname: Selector,
    comment_time: Selector,
    comment_text: Selector,
    like_count: Selector,
    recommend_root: Selector,
    recommend_card: Selector,
    recommend_title: Selector,
    recommend_poster: Selector,
    type_tag: Selector,
    episode_tag: Selector,
    passport: Regex,
}

impl Extractor {
    pub fn new(base_url: &str) -> Result<Self, ExtractError> {
        let base = Url::parse(base_url).map_err(|e| ExtractError::BaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            base,
            anchor: compile("a[href]")?,
            seed_card: compile("div.flex-video-list_flexTilesItem__bhNS9")?,
            seed_title: compile("p.flex-video-list_title__pTUUg")?,
            seed_poster: compile(r#"img[class*="flex-video-list_poster"]"#)?,
            detail_root: compile(
                r#"div[class*="metaDetail_"], div[class*="score_"], div[class*="star-list_"]"#,
            )?,
            score_label: compile("div.score_scoreLabel__fYRiV")?,
            score_count: compile("div.score_scoreCount__aNzvS")?,
            description: compile(r#"div[class*="metaDetail_infoValue"]"#)?,
            cast_name: compile("div.star-list_name__VSd6I")?,
            comment_block: compile(r#"div[id^="comment"]"#)?,
            avatar: compile("div.comments_avatarBox__7xweF img.comments_avatar__FU5C5")?,
            nickname: compile(r#"div[class^="comments_name__VQiPd"]"#)?,
            comment_time: compile("div.comments_time__00lty")?,
            comment_text: compile("div.comments_commentText__D48oR")?,
            like_count: compile("span#text")?,
            recommend_root: compile("#recommend_bk")?,
            recommend_card: compile(r#"div[style*="width: 162px; height: 266px;"]"#)?,
            recommend_title: compile(r#"span[class*="title__"]"#)?,
            recommend_poster: compile(r#"img[class*="videoImage"]"#)?,
            type_tag: compile(r#"div[class*="TypeTag"]"#)?,
            episode_tag: compile(r#"div[class*="subscript"]"#)?,
            passport: Regex::new(r"passport_(\d+)")?,
        })
    }

    /// Seed items from the listing view, in page order, at most `limit`.
    /// Cards without a name or link are skipped but still count toward the limit,
    /// since the limit applies to the cards shown on the listing.
    pub fn extract_seed_list(&self, markup: &str, limit: usize) -> Vec<SeedItem> {
        let document = Html::parse_document(markup);
        document
            .select(&self.seed_card)
            .take(limit)
            .filter_map(|card| {
                let name = first_text(card, &self.seed_title)?;
                let href = card
                    .select(&self.anchor)
                    .next()
                    .and_then(|a| a.value().attr("href"))?;
                let source_link = self.absolutize(href)?;
                let poster_url = first_attr(card, &self.seed_poster, "src")
                    .unwrap_or_else(|| DEFAULT_POSTER_URL.to_string());
                Some(SeedItem {
                    name,
                    source_link,
                    poster_url,
                })
            })
            .collect()
    }

    /// `None` when the page carries no detail panel at all.
    pub fn extract_item_detail(&self, markup: &str) -> Option<ItemDetail> {
        let document = Html::parse_document(markup);
        document.select(&self.detail_root).next()?;

        let defaults = ItemDetail::default();
        let root = document.root_element();
        let cast = root
            .select(&self.cast_name)
            .filter_map(element_text)
            .collect::<Vec<_>>();

        Some(ItemDetail {
            rating: first_text(root, &self.score_label).unwrap_or(defaults.rating),
            rating_count: first_text(root, &self.score_count).unwrap_or(defaults.rating_count),
            description: first_text(root, &self.description).unwrap_or(defaults.description),
            cast: if cast.is_empty() {
                defaults.cast
            } else {
                cast.join(", ")
            },
        })
    }

    /// First `limit` comment blocks in page order; blocks missing a nickname, time,
    /// content or like count are dropped.
    pub fn extract_comments(&self, markup: &str, limit: usize) -> Vec<Comment> {
        let document = Html::parse_document(markup);
        document
            .select(&self.comment_block)
            .take(limit)
            .filter_map(|block| {
                let avatar_url = first_attr(block, &self.avatar, "src");
                let user_id = avatar_url.as_deref().and_then(|url| {
                    self.passport
                        .captures(url)
                        .and_then(|caps| caps.get(1))
                        .map(|m| m.as_str().to_string())
                });
                Some(Comment {
                    nickname: first_text(block, &self.nickname)?,
                    user_id,
                    avatar_url,
                    time: first_text(block, &self.comment_time)?,
                    content: first_text(block, &self.comment_text)?,
                    like_count: first_text(block, &self.like_count)?,
                })
            })
            .collect()
    }

    /// Related candidates in the recommendation region, in page order, at most `limit`.
    /// Cards without a resolvable link or a name are discarded.
    pub fn extract_related_candidates(&self, markup: &str, limit: usize) -> Vec<RelatedItem> {
        let document = Html::parse_document(markup);
        let Some(region) = document.select(&self.recommend_root).next() else {
            return Vec::new();
        };
        region
            .select(&self.recommend_card)
            .filter_map(|card| {
                let source_link = card
                    .select(&self.anchor)
                    .filter_map(|a| a.value().attr("href"))
                    .find(|href| {
                        href.starts_with("http") || href.starts_with("//") || href.starts_with('/')
                    })
                    .and_then(|href| self.absolutize(href))?;
                let name = first_text(card, &self.recommend_title)?;
                Some(RelatedItem {
                    name,
                    source_link,
                    poster_url: first_attr(card, &self.recommend_poster, "src")
                        .unwrap_or_else(|| DEFAULT_POSTER_URL.to_string()),
                    kind: first_text(card, &self.type_tag),
                    episode_label: first_text(card, &self.episode_tag),
                })
            })
            .take(limit)
            .collect()
    }

    fn absolutize(&self, href: &str) -> Option<String> {
        let href = href.trim();
        if href.is_empty() {
            return None;
        }
        self.base.join(href).ok().map(String::from)
    }
}

/// Text of an element with each text node trimmed, `None` when nothing is left.
fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = element
        .text()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<String>();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).next().and_then(element_text)
}

fn first_attr(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> Extractor {
        Extractor::new("https://www.iqiyi.com/").unwrap()
    }

    #[test]
    fn seed_cards_without_names_are_skipped_within_the_limit() {
        let markup = r#"
            <div class="flex-video-list_flexTilesItem__bhNS9">
              <a href="//www.iqiyi.com/v_a.html"></a>
              <p class="undefined flex-video-list_title__pTUUg"> Alpha </p>
            </div>
            <div class="flex-video-list_flexTilesItem__bhNS9"><a href="/v_b.html"></a></div>
            <div class="flex-video-list_flexTilesItem__bhNS9">
              <a href="/v_c.html"></a>
              <p class="undefined flex-video-list_title__pTUUg">Gamma</p>
            </div>"#;

        let seeds = extractor().extract_seed_list(markup, 2);
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].name, "Alpha");
        assert_eq!(seeds[0].source_link, "https://www.iqiyi.com/v_a.html");
        assert_eq!(seeds[0].poster_url, DEFAULT_POSTER_URL);
    }

    #[test]
    fn detail_fields_fall_back_to_defaults() {
        let markup = r#"<div class="score_scoreCount__aNzvS">3.2万人评分</div>"#;
        let detail = extractor().extract_item_detail(markup).unwrap();
        assert_eq!(detail.rating_count, "3.2万人评分");
        assert_eq!(detail.rating, hotreel_core::DEFAULT_RATING);
        assert_eq!(detail.cast, hotreel_core::DEFAULT_CAST);
    }

    #[test]
    fn pages_without_a_detail_panel_are_not_found() {
        assert!(extractor().extract_item_detail("<html><body></body></html>").is_none());
    }

    #[test]
    fn comment_without_like_count_is_dropped() {
        let markup = r#"
            <div id="comment1">
              <div class="comments_name__VQiPd x">nick</div>
              <div class="comments_time__00lty">now</div>
              <div class="collapse-text_collapseText__zVrd2 comments_commentText__D48oR">hi</div>
            </div>"#;
        assert!(extractor().extract_comments(markup, COMMENT_LIMIT).is_empty());
    }

    #[test]
    fn related_cards_need_link_and_name() {
        let markup = r#"
            <div id="recommend_bk">
              <div style="width: 162px; height: 266px;">
                <a href="javascript:void(0)"></a>
                <span class="card_title__x">No Link</span>
              </div>
              <div style="width: 162px; height: 266px;">
                <a href="//www.iqiyi.com/v_ok.html"></a>
                <span class="card_title__x">Fine</span>
                <div class="card_TypeTag__y">Movie</div>
              </div>
            </div>"#;
        let related = extractor().extract_related_candidates(markup, RELATED_LIMIT);
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].source_link, "https://www.iqiyi.com/v_ok.html");
        assert_eq!(related[0].kind.as_deref(), Some("Movie"));
        assert_eq!(related[0].episode_label, None);
    }
}

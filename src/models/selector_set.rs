use serde::{Deserialize, Serialize};

/// A structural selector plus the three data selectors scoped inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSet {
    /// Matches one container element per listing.
    pub listing: String,
    pub title: String,
    pub price: String,
    pub link: String,
}

impl SelectorSet {
    pub fn new(listing: &str, title: &str, price: &str, link: &str) -> Self {
        Self {
            listing: listing.to_string(),
            title: title.to_string(),
            price: price.to_string(),
            link: link.to_string(),
        }
    }

    pub fn selectors(&self) -> [&str; 4] {
        [&self.listing, &self.title, &self.price, &self.link]
    }

    /// Current ad-card markup.
    pub fn default_primary() -> Self {
        Self::new(
            r#"section[data-ds-component="DS-AdCard"]"#,
            r#"h2[data-ds-component="DS-Text"]"#,
            r#"h3[data-ds-component="DS-Text"]"#,
            "a",
        )
    }

    /// Older markup generations, newest first.
    pub fn default_fallbacks() -> Vec<Self> {
        vec![
            Self::new(
                r#"section[data-ds-component="DS-AdCard"]"#,
                r#"h2[data-ds-component="DS-Text"]"#,
                r#"span[data-ds-component="DS-Text"]"#,
                r#"a[data-ds-component="DS-NewAdCard-Link"]"#,
            ),
            Self::new("div.sc-9190c537-2", "h2.sc-1iuc9a2-1", "span.m7nrfa-0", "a.kgl1mq-0"),
            Self::new("li.ej84nb0", "div.ej84nb3", "div.ej84nb5", "a.ej84nb8"),
        ]
    }
}

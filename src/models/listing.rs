use serde::{Deserialize, Serialize};

/// One ad card as extracted from the page, before price parsing.
///
/// Every field is optional: a container that matched the structural selector
/// may still be missing individual data nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub url: Option<String>,
}

impl Listing {
    pub fn has_data(&self) -> bool {
        self.title.is_some() || self.price_text.is_some() || self.url.is_some()
    }

    pub fn title_or_default(&self) -> &str {
        self.title.as_deref().unwrap_or("Untitled")
    }
}

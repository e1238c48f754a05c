//! Hashtag topic filter for posts.

use regex::{Regex, RegexBuilder};

use crate::{Error, Result};

/// Posts must mention `#survivor`, optionally followed by digits or `cbs`.
pub const DEFAULT_INCLUDE_PATTERN: &str = r"#survivor(\d*|cbs)?";

/// Hashtags that share the prefix but belong to other topics.
pub const DEFAULT_EXCLUDE_PATTERN: &str = "#survivorseries|#survivorgameplay|#deadbydaylight|\
#survivors|#survivorslike|#rainworld|#survivorlike|#survivorsguilt|#survivorguilt|#csasurvivor|\
#survivorsempowered|#mentalhealth|#excult|#traffickingsurvivor|#survivorcoach|#survivormusic|\
#abortion|#csa|#sa|#cptsd|#iptv";

/// Include/exclude regex pair applied to lowercased post text.
///
/// Both patterns match anywhere in the text, case-insensitively.
#[derive(Debug, Clone)]
pub struct PostFilter {
    include: Regex,
    exclude: Regex,
}

impl PostFilter {
    pub fn new(include: &str, exclude: &str) -> Result<Self> {
        Ok(Self {
            include: build(include)?,
            exclude: build(exclude)?,
        })
    }

    /// Whether a post belongs in the feed.
    pub fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        if !self.include.is_match(&text) {
            return false;
        }
        if self.exclude.is_match(&text) {
            tracing::debug!("Post matched include but also exclude pattern: {}", text);
            return false;
        }
        true
    }
}

fn build(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::Config(format!("invalid filter pattern '{}': {}", pattern, e)))
}

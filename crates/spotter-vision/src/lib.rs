//! Template matching engine: stored reference images are slid over screen
//! captures to recover the screen coordinates of a known UI element.

pub mod codec;
mod matcher;
mod template;

pub use matcher::{find_all_matches, find_match, MatchConfig, MatchResult};
pub use template::{Template, TemplateError};

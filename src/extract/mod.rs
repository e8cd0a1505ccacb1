//! Client side of a delta image: manifest parsing, per-image templates and
//! streaming extraction into shared layer directories.

mod error;
mod layer;
mod reader;
mod signal;
mod template;

pub use error::{ExtractError, ExtractResult};
pub use layer::{LayerMeta, LayerStore};
pub use reader::{ExtractSummary, ImageReader};
pub use signal::{ReadyState, Readiness};
pub use template::{EntryState, ExtractTarget, Template, TemplateNode};

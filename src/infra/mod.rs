mod cache;
mod detail;
mod export;
mod scan;
mod tail;

pub use cache::*;
pub use detail::*;
pub use export::*;
pub use scan::*;
pub use tail::*;

//! Utility
//!
//! **This module is exempt from the API stability guarantee.** It's exposed
//! only because `Init` is needed to declare kernel objects in `static`s.
mod init;
mod prio_bitfield;
pub use self::{init::*, prio_bitfield::*};

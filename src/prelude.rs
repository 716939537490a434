pub use crate::{end_group, start_group};
#[allow(unused_imports)]
pub use anyhow::{Context, Error, Result, anyhow, bail, ensure};
pub use log::*;

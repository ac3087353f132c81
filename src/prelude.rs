pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::options::Options;
pub use crate::utils::Utils;

pub use anyhow::{anyhow, bail, Context as _, Error, Result};
pub use log::{debug, error, info, trace, warn};

pub use std::io::Write;
pub use std::str::FromStr;
pub use std::sync::Arc;
pub use std::time::Duration;

pub use tokio::sync::broadcast;

pub use std::collections::{HashMap, HashSet};
pub use std::path::{Path, PathBuf};
pub use std::time::{Duration, SystemTime};

pub use eyre::{bail, Result, WrapErr};
pub use once_cell::sync::Lazy;
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, warn};

pub use crate::error::CacheError;

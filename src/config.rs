// SPDX-License-Identifier: BSD-3-Clause
//! Analysis configuration: function tables and limits
//!
//! Function tables map regular expressions over function names to a payload
//! (argument roles). Patterns are anchored, so a plain identifier only
//! matches itself.

use std::collections::BTreeMap;
use std::path::Path;

use regex::RegexSet;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Bad function pattern: {0}")]
    Regex(#[from] regex::Error),
    #[error("Bad argument index {0}, expected -1 (return value) or a parameter index")]
    ArgIndex(i64),
    #[error("Couldn't read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Couldn't deserialize configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Position of a value at a call: an actual argument, or the returned value.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ArgIndex {
    Return,
    Arg(usize),
}

impl TryFrom<i64> for ArgIndex {
    type Error = ConfigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(ArgIndex::Return),
            n if n >= 0 => usize::try_from(n)
                .map(ArgIndex::Arg)
                .map_err(|_| ConfigError::ArgIndex(n)),
            n => Err(ConfigError::ArgIndex(n)),
        }
    }
}

impl From<ArgIndex> for i64 {
    fn from(value: ArgIndex) -> Self {
        match value {
            ArgIndex::Return => -1,
            // Parameter counts are far below i64::MAX
            ArgIndex::Arg(n) => n as i64,
        }
    }
}

impl std::fmt::Display for ArgIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgIndex::Return => write!(f, "ret"),
            ArgIndex::Arg(n) => write!(f, "arg{}", n),
        }
    }
}

/// Roles of the arguments of a copy/move function such as `memcpy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct CopySpec {
    pub src: ArgIndex,
    pub dst: ArgIndex,
    pub size: ArgIndex,
}

/// Roles of the arguments of a function fetching untrusted data, e.g.
/// `copy_from_user(dst, src, n)`. A `dst` of [`ArgIndex::Return`] means the
/// fetched data is the return value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct FetchSpec {
    pub dst: ArgIndex,
    pub src: ArgIndex,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub error_handling_functions: Vec<String>,
    pub copy_functions: BTreeMap<String, CopySpec>,
    pub data_fetch_functions: BTreeMap<String, FetchSpec>,
    pub entry_points: Vec<String>,
    /// Functions with more blocks are not analysed
    pub max_blocks: usize,
    /// Blocks visited by one forward or backward check search
    pub max_depth: usize,
    /// Keys whose unchecked share exceeds this are reported
    pub unchecked_ratio: f64,
    /// Match checks performed on aliases of a tracked pointer
    pub alias_checks: bool,
}

const ERROR_HANDLING_FUNCTIONS: &[&str] = &[
    "BUG",
    "BUG_ON",
    "ASM_BUG",
    "panic",
    "ASSERT",
    "assert",
    "dump_stack",
    "__warn_printk",
    "usercopy_warn",
    "signal_fault",
    "pr_err",
    "pr_warn",
    "pr_warning",
    "pr_alert",
    "pr_emerg",
    "pr_crit",
];

const COPY_FUNCTIONS: &[&str] = &[
    "memcpy",
    "__memcpy",
    r"llvm\.memcpy\..*",
    "strncpy",
    "memmove",
    "__memmove",
    r"llvm\.memmove\..*",
];

const FETCH_DST0_SRC1: &[&str] = &[
    "copy_from_user",
    "_copy_from_user",
    "__copy_from_user",
    "raw_copy_from_user",
    "strncpy_from_user",
    "_strncpy_from_user",
    "__strncpy_from_user",
    "__copy_from_user_inatomic",
    "get_user",
    "__get_user",
    "rds_message_copy_from_user",
    "ivtv_buf_copy_from_user",
    "snd_trident_synth_copy_from_user",
    "copy_from_user_toio",
    "iov_iter_copy_from_user_atomic",
    "__generic_copy_from_user",
    "__constant_copy_from_user",
    "copy_from_user_page",
    "__copy_from_user_eva",
    "__arch_copy_from_user",
    "__copy_from_user_flushcache",
    "arm_copy_from_user",
    "__asm_copy_from_user",
    "__copy_from_user_inatomic_nocache",
    "copy_from_user_nmi",
    "copy_from_user_proc",
];

const FETCH_RET_SRC0: &[&str] = &[
    "strndup_user",
    "memdup_user",
    "vmemdup_user",
    "memdup_user_nul",
    "fubyte",
    "fusword",
    "fuswintr",
    "fuword",
];

const FETCH_DST1_SRC0: &[&str] = &["copyin", "copyin_str", "copyin_nofault"];

impl Default for Config {
    fn default() -> Self {
        let mut copy_functions = BTreeMap::new();
        for f in COPY_FUNCTIONS {
            copy_functions.insert(
                f.to_string(),
                CopySpec {
                    src: ArgIndex::Arg(1),
                    dst: ArgIndex::Arg(0),
                    size: ArgIndex::Arg(2),
                },
            );
        }
        let mut data_fetch_functions = BTreeMap::new();
        for (names, dst, src) in [
            (FETCH_DST0_SRC1, ArgIndex::Arg(0), ArgIndex::Arg(1)),
            (FETCH_RET_SRC0, ArgIndex::Return, ArgIndex::Arg(0)),
            (FETCH_DST1_SRC0, ArgIndex::Arg(1), ArgIndex::Arg(0)),
        ] {
            for f in names {
                data_fetch_functions.insert(f.to_string(), FetchSpec { dst, src });
            }
        }
        Config {
            error_handling_functions: ERROR_HANDLING_FUNCTIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            copy_functions,
            data_fetch_functions,
            entry_points: vec![r"__do_sys_.*".to_string(), r"__se_sys_.*".to_string()],
            max_blocks: 500,
            max_depth: 1000,
            unchecked_ratio: 0.1,
            alias_checks: true,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&s)
    }

    /// Append error-handling functions listed one per line in `path`.
    pub fn add_error_functions(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let before = self.error_handling_functions.len();
        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let pattern = regex::escape(line);
            if !self.error_handling_functions.contains(&pattern) {
                self.error_handling_functions.push(pattern);
            }
        }
        Ok(self.error_handling_functions.len() - before)
    }
}

/// A set of function-name patterns with one payload per pattern.
#[derive(Debug)]
pub struct FunctionTable<T> {
    payloads: Vec<T>,
    set: RegexSet,
}

impl<T> Default for FunctionTable<T> {
    fn default() -> Self {
        FunctionTable {
            payloads: Vec::new(),
            set: RegexSet::empty(),
        }
    }
}

impl<T: Clone> FunctionTable<T> {
    pub fn new<'a, I>(entries: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (&'a str, T)>,
    {
        let mut patterns = Vec::new();
        let mut payloads = Vec::new();
        for (pattern, payload) in entries {
            patterns.push(format!("^(?:{})$", pattern));
            payloads.push(payload);
        }
        let set = RegexSet::new(patterns)?;
        Ok(FunctionTable { payloads, set })
    }

    pub fn contains(&self, func: &str) -> bool {
        self.set.is_match(func)
    }

    /// Payload of the first pattern matching `func`
    pub fn get(&self, func: &str) -> Option<T> {
        self.set
            .matches(func)
            .into_iter()
            .next()
            .map(|m| self.payloads[m].clone())
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

/// Compiled form of the function tables in a [`Config`]
#[derive(Debug, Default)]
pub struct Tables {
    pub error_handling: FunctionTable<()>,
    pub copy: FunctionTable<CopySpec>,
    pub fetch: FunctionTable<FetchSpec>,
    pub entry_points: FunctionTable<()>,
}

impl Tables {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Tables {
            error_handling: FunctionTable::new(
                config
                    .error_handling_functions
                    .iter()
                    .map(|f| (f.as_str(), ())),
            )?,
            copy: FunctionTable::new(config.copy_functions.iter().map(|(f, s)| (f.as_str(), *s)))?,
            fetch: FunctionTable::new(
                config
                    .data_fetch_functions
                    .iter()
                    .map(|(f, s)| (f.as_str(), *s)),
            )?,
            entry_points: FunctionTable::new(config.entry_points.iter().map(|f| (f.as_str(), ())))?,
        })
    }
}

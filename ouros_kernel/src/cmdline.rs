//! Kernel command line parsing.

use kmem::PAGE_ALIGN_BITS;
use log::LevelFilter;
use thiserror::Error;

/// Zero-copy tokenizer for a kernel command line.
///
/// Words are separated by whitespace. A word is either a flag or a `key=value` pair, and keys
/// as well as values may be quoted to include whitespace or `=`.
pub struct CmdLine<'a> {
    rest: &'a str,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CmdLineToken<'a> {
    Flag(&'a str),
    KeyValuePair(&'a str, &'a str),
}

impl<'a> CmdLine<'a> {
    pub fn parse(raw: &'a str) -> CmdLine<'a> {
        CmdLine { rest: raw }
    }

    /// Take the next word. An unquoted key ends at `=`, an unquoted value only at whitespace.
    /// An unterminated quote extends to the end of the line.
    fn take_word(&mut self, stop_at_equals: bool) -> Option<&'a str> {
        if let Some(quoted) = self.rest.strip_prefix('"') {
            let (word, rest) = match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            };
            self.rest = rest;
            return Some(word);
        }
        if self.rest.is_empty() {
            return None;
        }
        let end = self
            .rest
            .find(|c: char| c.is_whitespace() || (stop_at_equals && c == '='))
            .unwrap_or(self.rest.len());
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(word)
    }
}

impl<'a> Iterator for CmdLine<'a> {
    type Item = CmdLineToken<'a>;

    fn next(&mut self) -> Option<CmdLineToken<'a>> {
        self.rest = self.rest.trim_start();
        let key = self.take_word(true)?;
        match self.rest.strip_prefix('=') {
            Some(value) => {
                self.rest = value;
                let value = self.take_word(false).unwrap_or("");
                Some(CmdLineToken::KeyValuePair(key, value))
            }
            None => Some(CmdLineToken::Flag(key)),
        }
    }
}

/// Parse a size with an optional `K`, `M` or `G` suffix.
///
/// The number is decimal, hexadecimal with a `0x` prefix or octal with a leading `0`.
pub fn memparse(value: &str) -> Option<u64> {
    let split = value.find(|c: char| matches!(c, 'K' | 'k' | 'M' | 'm' | 'G' | 'g')).unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);

    let bytes = if let Some(hex) = number.strip_prefix("0x").or_else(|| number.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()?
    } else if number.len() > 1 && number.starts_with('0') {
        u64::from_str_radix(&number[1..], 8).ok()?
    } else {
        number.parse::<u64>().ok()?
    };

    let shift = match suffix {
        "" => 0,
        "K" | "k" => 10,
        "M" | "m" => 20,
        "G" | "g" => 30,
        _ => return None,
    };
    bytes.checked_mul(1 << shift)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BootOptionError<'a> {
    #[error("invalid size {value:?} for {key}=")]
    InvalidSize { key: &'a str, value: &'a str },
    #[error("invalid log level {0:?}, expected 0 to 5")]
    InvalidLogLevel(&'a str),
}

/// Options of the boot command line that concern memory setup and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    /// Pages of high memory requested with `highmem=`.
    pub highmem_pages: Option<usize>,
    /// No usable memory at or above this address, from `mem=`.
    pub mem_limit: Option<u64>,
    pub log_level: LevelFilter,
}

impl Default for BootOptions {
    fn default() -> BootOptions {
        BootOptions {
            highmem_pages: None,
            mem_limit: None,
            log_level: LevelFilter::Info,
        }
    }
}

impl BootOptions {
    /// Collect the options, ignoring unknown words. Malformed values are logged and skipped.
    pub fn parse(cmdline: &str) -> BootOptions {
        let mut options = BootOptions::default();
        for token in CmdLine::parse(cmdline) {
            if let Err(err) = options.apply(token) {
                warn!("[setup] ignoring boot option: {}", err);
            }
        }
        options
    }

    fn apply<'a>(&mut self, token: CmdLineToken<'a>) -> Result<(), BootOptionError<'a>> {
        match token {
            CmdLineToken::Flag("debug") => self.log_level = LevelFilter::Debug,
            CmdLineToken::Flag("quiet") => self.log_level = LevelFilter::Warn,
            CmdLineToken::KeyValuePair(key @ "highmem", value) => {
                let bytes = memparse(value).ok_or(BootOptionError::InvalidSize { key, value })?;
                self.highmem_pages = Some((bytes >> PAGE_ALIGN_BITS) as usize);
            }
            CmdLineToken::KeyValuePair(key @ "mem", value) => {
                self.mem_limit = Some(memparse(value).ok_or(BootOptionError::InvalidSize { key, value })?);
            }
            CmdLineToken::KeyValuePair("loglevel", value) => {
                self.log_level = match value {
                    "0" => LevelFilter::Off,
                    "1" => LevelFilter::Error,
                    "2" => LevelFilter::Warn,
                    "3" => LevelFilter::Info,
                    "4" => LevelFilter::Debug,
                    "5" => LevelFilter::Trace,
                    _ => return Err(BootOptionError::InvalidLogLevel(value)),
                };
            }
            _ => {}
        }
        Ok(())
    }
}

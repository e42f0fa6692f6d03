//! Filter chains as human-readable strings.
//!
//! Grammar: `filter ( '+' filter )*` where each filter is
//! `name ( '=' ( preset_digit | opt ':' value ( ',' opt ':' value )* ) )?`.
//! Size values accept the 1024-based suffixes `k`, `Ki`, `KiB`, `M`, `Mi`,
//! `MiB`, `G`, `Gi`, `GiB`.
//!
//! Examples: `lzma2=6`, `delta=dist:4+lzma2=dict:8MiB`,
//! `x86=start:16+lzma2=dict:64MiB`.

use crate::filter::{Filter, FilterId, FilterOptions};
use ruxz_core::error::{Error, Result};

/// Preset dictionary sizes for the digits 0..=9.
const PRESET_DICT_SIZES: [u32; 10] = [
    1 << 16,
    1 << 18,
    1 << 19,
    1 << 20,
    1 << 21,
    1 << 22,
    1 << 23,
    1 << 24,
    1 << 25,
    1 << 26,
];

fn filter_name(id: FilterId) -> &'static str {
    match id {
        FilterId::Delta => "delta",
        FilterId::X86 => "x86",
        FilterId::PowerPc => "powerpc",
        FilterId::Ia64 => "ia64",
        FilterId::Arm => "arm",
        FilterId::ArmThumb => "armthumb",
        FilterId::Sparc => "sparc",
        FilterId::Arm64 => "arm64",
        FilterId::Lzma1 => "lzma1",
        FilterId::Lzma2 => "lzma2",
    }
}

fn filter_by_name(name: &str) -> Result<FilterId> {
    Ok(match name {
        "delta" => FilterId::Delta,
        "x86" => FilterId::X86,
        "powerpc" => FilterId::PowerPc,
        "ia64" => FilterId::Ia64,
        "arm" => FilterId::Arm,
        "armthumb" => FilterId::ArmThumb,
        "sparc" => FilterId::Sparc,
        "arm64" => FilterId::Arm64,
        "lzma1" => FilterId::Lzma1,
        "lzma2" => FilterId::Lzma2,
        _ => return Err(Error::options(format!("unknown filter name \"{name}\""))),
    })
}

/// Render a size with the largest suffix that divides it evenly.
fn size_to_str(value: u64) -> String {
    if value != 0 && value % (1 << 30) == 0 {
        format!("{}GiB", value >> 30)
    } else if value != 0 && value % (1 << 20) == 0 {
        format!("{}MiB", value >> 20)
    } else if value != 0 && value % (1 << 10) == 0 {
        format!("{}KiB", value >> 10)
    } else {
        value.to_string()
    }
}

/// Parse a number with an optional 1024-based suffix.
fn parse_size(text: &str) -> Result<u64> {
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    if digits_end == 0 {
        return Err(Error::options(format!("\"{text}\" is not a number")));
    }

    let value: u64 = text[..digits_end]
        .parse()
        .map_err(|_| Error::options(format!("\"{text}\" is out of range")))?;

    let shift = match &text[digits_end..] {
        "" => 0,
        "k" | "K" | "Ki" | "KiB" => 10,
        "M" | "Mi" | "MiB" => 20,
        "G" | "Gi" | "GiB" => 30,
        suffix => {
            return Err(Error::options(format!("unknown size suffix \"{suffix}\"")))
        }
    };

    value
        .checked_shl(shift)
        .filter(|v| v >> shift == value)
        .ok_or_else(|| Error::options(format!("\"{text}\" is out of range")))
}

fn parse_u32(text: &str) -> Result<u32> {
    u32::try_from(parse_size(text)?)
        .map_err(|_| Error::options(format!("\"{text}\" is out of range")))
}

/// Format a filter chain as a string.
pub fn filters_to_str(filters: &[Filter]) -> Result<String> {
    if filters.is_empty() {
        return Err(Error::options("empty filter chain"));
    }

    let mut out = String::new();
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            out.push('+');
        }
        out.push_str(filter_name(filter.id));

        match &filter.options {
            FilterOptions::Lzma2 { dict_size } => {
                out.push_str("=dict:");
                out.push_str(&size_to_str(u64::from(*dict_size)));
            }
            FilterOptions::Lzma1 { dict_size, lc, lp, pb } => {
                out.push_str("=dict:");
                out.push_str(&size_to_str(u64::from(*dict_size)));
                out.push_str(&format!(",lc:{lc},lp:{lp},pb:{pb}"));
            }
            FilterOptions::Delta { distance } => {
                out.push_str(&format!("=dist:{distance}"));
            }
            FilterOptions::Bcj { start_offset } => {
                if let Some(offset) = start_offset {
                    out.push_str(&format!("=start:{offset}"));
                }
            }
        }
    }

    Ok(out)
}

fn default_options(id: FilterId) -> FilterOptions {
    match id {
        FilterId::Lzma2 => FilterOptions::Lzma2 {
            dict_size: PRESET_DICT_SIZES[6],
        },
        FilterId::Lzma1 => FilterOptions::Lzma1 {
            dict_size: PRESET_DICT_SIZES[6],
            lc: 3,
            lp: 0,
            pb: 2,
        },
        FilterId::Delta => FilterOptions::Delta { distance: 1 },
        _ => FilterOptions::Bcj { start_offset: None },
    }
}

fn apply_option(id: FilterId, options: &mut FilterOptions, key: &str, value: &str) -> Result<()> {
    match (options, key) {
        (FilterOptions::Lzma2 { dict_size }, "dict")
        | (FilterOptions::Lzma1 { dict_size, .. }, "dict") => {
            *dict_size = parse_u32(value)?;
        }
        (FilterOptions::Lzma1 { lc, .. }, "lc") => *lc = parse_u32(value)?,
        (FilterOptions::Lzma1 { lp, .. }, "lp") => *lp = parse_u32(value)?,
        (FilterOptions::Lzma1 { pb, .. }, "pb") => *pb = parse_u32(value)?,
        (FilterOptions::Delta { distance }, "dist") => *distance = parse_u32(value)?,
        (FilterOptions::Bcj { start_offset }, "start") => {
            *start_offset = Some(parse_u32(value)?);
        }
        _ => {
            return Err(Error::options(format!(
                "filter \"{}\" has no option \"{key}\"",
                filter_name(id)
            )))
        }
    }
    Ok(())
}

fn parse_filter(text: &str) -> Result<Filter> {
    let (name, opts_text) = match text.split_once('=') {
        Some((name, rest)) => (name, Some(rest)),
        None => (text, None),
    };

    let id = filter_by_name(name)?;
    let mut options = default_options(id);

    if let Some(opts_text) = opts_text {
        // A single digit selects a preset for the compression filters.
        if opts_text.len() == 1 && opts_text.as_bytes()[0].is_ascii_digit() {
            let preset = usize::from(opts_text.as_bytes()[0] - b'0');
            match &mut options {
                FilterOptions::Lzma2 { dict_size }
                | FilterOptions::Lzma1 { dict_size, .. } => {
                    *dict_size = PRESET_DICT_SIZES[preset];
                }
                _ => {
                    return Err(Error::options(format!(
                        "filter \"{name}\" does not take a preset"
                    )))
                }
            }
        } else {
            for pair in opts_text.split(',') {
                let (key, value) = pair.split_once(':').ok_or_else(|| {
                    Error::options(format!("expected option:value, got \"{pair}\""))
                })?;
                apply_option(id, &mut options, key, value)?;
            }
        }
    }

    Ok(Filter { id, options })
}

/// Parse a filter-chain string.
pub fn filters_from_str(text: &str) -> Result<Vec<Filter>> {
    if text.is_empty() {
        return Err(Error::options("empty filter string"));
    }
    text.split('+').map(parse_filter).collect()
}

//! Kickstart reader for the commands an image build needs.
//!
//! Only `part`, `bootloader` and `network` are interpreted. Everything else,
//! including `%packages`/`%post` sections, is skipped.

use anyhow::{bail, Context, Result};
use log::debug;
use std::fmt;
use std::fs;
use std::path::Path;

const MIB: u64 = 1024 * 1024;
const KIB: u64 = 1024;

/// One `part` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Size in bytes.
    pub size: u64,
    pub disk: Option<String>,
    pub mountpoint: String,
    pub fstype: Option<String>,
    pub label: Option<String>,
    /// Start alignment in bytes.
    pub align: Option<u64>,
    pub boot: bool,
    pub fsopts: Option<String>,
    /// Extra arguments for the formatter.
    pub extopts: Option<String>,
    pub uuid: Option<String>,
    pub exclude_from_image: bool,
}

impl PartitionSpec {
    pub fn new(mountpoint: &str, size_mib: u64, disk: &str, fstype: &str) -> Self {
        Self {
            size: size_mib * MIB,
            disk: Some(disk.to_string()),
            mountpoint: mountpoint.to_string(),
            fstype: Some(fstype.to_string()),
            label: None,
            align: None,
            boot: false,
            fsopts: None,
            extopts: None,
            uuid: None,
            exclude_from_image: false,
        }
    }

    pub fn is_swap(&self) -> bool {
        self.fstype.as_deref() == Some("swap") || self.mountpoint == "swap"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionTable {
    #[default]
    Msdos,
    Gpt,
}

impl PartitionTable {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "msdos" => Ok(PartitionTable::Msdos),
            "gpt" => Ok(PartitionTable::Gpt),
            other => bail!("Unknown partition table '{}' (expected msdos or gpt)", other),
        }
    }
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionTable::Msdos => write!(f, "msdos"),
            PartitionTable::Gpt => write!(f, "gpt"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootloaderSpec {
    /// Extra kernel command line.
    pub append: String,
    pub ptable: PartitionTable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kickstart {
    pub partitions: Vec<PartitionSpec>,
    pub bootloader: BootloaderSpec,
    /// Number of `network` lines.
    pub network_count: u32,
}

impl Kickstart {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read kickstart {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid kickstart {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut partitions = Vec::new();
        let mut bootloader = BootloaderSpec::default();
        let mut network_count = 0;
        let mut in_section = false;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if in_section {
                if line == "%end" {
                    in_section = false;
                }
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('%') {
                in_section = true;
                continue;
            }

            let words = split_words(line)
                .with_context(|| format!("line {}: cannot split '{}'", lineno + 1, line))?;
            let Some((command, args)) = words.split_first() else {
                continue;
            };

            match command.as_str() {
                "part" | "partition" => partitions.push(
                    parse_part(args).with_context(|| format!("line {}: bad part", lineno + 1))?,
                ),
                "bootloader" => {
                    bootloader = parse_bootloader(args)
                        .with_context(|| format!("line {}: bad bootloader", lineno + 1))?
                }
                "network" => network_count += 1,
                other => debug!("kickstart: ignoring '{}'", other),
            }
        }

        if partitions.is_empty() {
            partitions.push(PartitionSpec::new("/", 1900, "sda", "ext3"));
        }

        Ok(Self {
            partitions,
            bootloader,
            network_count,
        })
    }
}

/// Split a line into words, honouring single and double quotes.
fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut has_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                has_word = true;
            }
            None if c.is_whitespace() => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            None => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if quote.is_some() {
        bail!("unterminated quote");
    }
    if has_word {
        words.push(current);
    }
    Ok(words)
}

/// Options that take a value, either as `--opt=value` or `--opt value`.
const PART_VALUE_OPTS: &[&str] = &[
    "size",
    "ondisk",
    "ondrive",
    "fstype",
    "label",
    "align",
    "fsoptions",
    "extoptions",
    "uuid",
];

/// Walk `--option` words, yielding `(name, value)` pairs and positional words
/// (with an empty name).
fn options<'a>(args: &'a [String], value_opts: &[&str]) -> Result<Vec<(&'a str, Option<&'a str>)>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let word = args[i].as_str();
        i += 1;
        let Some(opt) = word.strip_prefix("--") else {
            out.push(("", Some(word)));
            continue;
        };
        if let Some((name, value)) = opt.split_once('=') {
            out.push((name, Some(value)));
        } else if value_opts.contains(&opt) {
            let value = args
                .get(i)
                .with_context(|| format!("--{} needs a value", opt))?;
            i += 1;
            out.push((opt, Some(value.as_str())));
        } else {
            out.push((opt, None));
        }
    }
    Ok(out)
}

fn number(name: &str, value: Option<&str>) -> Result<u64> {
    let value = value.with_context(|| format!("--{} needs a value", name))?;
    value
        .parse()
        .with_context(|| format!("--{} must be a number, got '{}'", name, value))
}

/// `number` in units of `unit` bytes.
fn scaled(name: &str, value: Option<&str>, unit: u64) -> Result<u64> {
    let n = number(name, value)?;
    n.checked_mul(unit)
        .with_context(|| format!("--{}={} is too large", name, n))
}

fn parse_part(args: &[String]) -> Result<PartitionSpec> {
    let mut mountpoint = None;
    let mut spec = PartitionSpec {
        size: 0,
        disk: None,
        mountpoint: String::new(),
        fstype: None,
        label: None,
        align: None,
        boot: false,
        fsopts: None,
        extopts: None,
        uuid: None,
        exclude_from_image: false,
    };

    for (name, value) in options(args, PART_VALUE_OPTS)? {
        let text = value.map(str::to_string);
        match name {
            "" => {
                if mountpoint.is_some() {
                    bail!("more than one mountpoint");
                }
                mountpoint = text;
            }
            "size" => spec.size = scaled(name, value, MIB)?,
            "ondisk" | "ondrive" => spec.disk = text,
            "fstype" => spec.fstype = text,
            "label" => spec.label = text,
            "align" => spec.align = Some(scaled(name, value, KIB)?),
            "fsoptions" => spec.fsopts = text,
            "extoptions" => spec.extopts = text,
            "uuid" => spec.uuid = text,
            "active" => spec.boot = true,
            "exclude-from-image" => spec.exclude_from_image = true,
            other => debug!("part: ignoring --{}", other),
        }
    }

    spec.mountpoint = mountpoint.context("missing mountpoint")?;
    if spec.mountpoint == "swap" && spec.fstype.is_none() {
        spec.fstype = Some("swap".to_string());
    }
    Ok(spec)
}

fn parse_bootloader(args: &[String]) -> Result<BootloaderSpec> {
    let mut spec = BootloaderSpec::default();
    for (name, value) in options(args, &["append", "ptable", "timeout", "location"])? {
        match (name, value) {
            ("append", Some(v)) => spec.append = v.to_string(),
            ("ptable", Some(v)) => spec.ptable = PartitionTable::from_name(v)?,
            (other, _) => debug!("bootloader: ignoring {}", other),
        }
    }
    Ok(spec)
}

// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Instruction-set architecture model, including the x86-64 microarchitecture levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A baseline or extended instruction-set architecture.
///
/// The x86-64 microarchitecture levels (`v2`..`v4`) share the `x86_64`
/// baseline; every other value is its own baseline. Ordering of levels within
/// a baseline follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Architecture {
    #[serde(rename = "aarch64")]
    Aarch64,
    #[serde(rename = "armv7l")]
    Armv7l,
    #[serde(rename = "i686")]
    I686,
    #[serde(rename = "loongarch64")]
    Loongarch64,
    #[serde(rename = "ppc64")]
    Ppc64,
    #[serde(rename = "ppc64le")]
    Ppc64le,
    #[serde(rename = "riscv64")]
    Riscv64,
    #[serde(rename = "s390x")]
    S390x,
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "x86_64_v2")]
    X86_64V2,
    #[serde(rename = "x86_64_v3")]
    X86_64V3,
    #[serde(rename = "x86_64_v4")]
    X86_64V4,
}

impl Architecture {
    /// The baseline this architecture is an extension of.
    #[must_use]
    pub fn baseline(self) -> Architecture {
        match self {
            Self::X86_64 | Self::X86_64V2 | Self::X86_64V3 | Self::X86_64V4 => Self::X86_64,
            other => other,
        }
    }

    fn level(self) -> u8 {
        match self {
            Self::X86_64V2 => 2,
            Self::X86_64V3 => 3,
            Self::X86_64V4 => 4,
            _ => 1,
        }
    }

    /// Whether `self` guarantees at least everything `other` requires.
    ///
    /// Architectures with different baselines are never comparable.
    #[must_use]
    pub fn is_superset(self, other: Architecture) -> bool {
        self.baseline() == other.baseline() && self.level() >= other.level()
    }

    /// The canonical string form, matching the policy catalog keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aarch64 => "aarch64",
            Self::Armv7l => "armv7l",
            Self::I686 => "i686",
            Self::Loongarch64 => "loongarch64",
            Self::Ppc64 => "ppc64",
            Self::Ppc64le => "ppc64le",
            Self::Riscv64 => "riscv64",
            Self::S390x => "s390x",
            Self::X86_64 => "x86_64",
            Self::X86_64V2 => "x86_64_v2",
            Self::X86_64V3 => "x86_64_v3",
            Self::X86_64V4 => "x86_64_v4",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aarch64" => Ok(Self::Aarch64),
            "armv7l" => Ok(Self::Armv7l),
            "i686" => Ok(Self::I686),
            "loongarch64" => Ok(Self::Loongarch64),
            "ppc64" => Ok(Self::Ppc64),
            "ppc64le" => Ok(Self::Ppc64le),
            "riscv64" => Ok(Self::Riscv64),
            "s390x" => Ok(Self::S390x),
            "x86_64" => Ok(Self::X86_64),
            "x86_64_v2" => Ok(Self::X86_64V2),
            "x86_64_v3" => Ok(Self::X86_64V3),
            "x86_64_v4" => Ok(Self::X86_64V4),
            other => Err(format!("unknown architecture: {other}")),
        }
    }
}

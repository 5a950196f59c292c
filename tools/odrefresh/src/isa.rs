//! Instruction sets and zygote process layouts.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// A compilation target instruction set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isa {
    /// 32-bit ARM.
    Arm,
    /// AArch64.
    Arm64,
    /// 32-bit x86.
    X86,
    /// x86-64.
    X86_64,
    /// 64-bit RISC-V.
    Riscv64,
}

impl Isa {
    /// Name used in artifact directories and on the compiler command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
            Self::X86 => "x86",
            Self::X86_64 => "x86_64",
            Self::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Isa {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "arm" => Self::Arm,
            "arm64" => Self::Arm64,
            "x86" => Self::X86,
            "x86_64" => Self::X86_64,
            "riscv64" => Self::Riscv64,
            other => bail!("unknown instruction set '{other}'"),
        })
    }
}

/// The device's instruction set family: an optional 32-bit ISA and a 64-bit one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IsaPair {
    /// 32-bit instruction set, if the family has one.
    pub isa32: Option<Isa>,
    /// 64-bit instruction set.
    pub isa64: Isa,
}

impl IsaPair {
    /// The pair matching the build host, used when nothing is configured.
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "aarch64" | "arm" => "arm64".parse(),
            "riscv64" => "riscv64".parse(),
            _ => "x86_64".parse(),
        }
        .unwrap_or(Self { isa32: Some(Isa::X86), isa64: Isa::X86_64 })
    }
}

impl FromStr for IsaPair {
    type Err = anyhow::Error;

    /// Accepts the 64-bit member of a family: `arm64`, `x86_64`, `riscv64`.
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.parse::<Isa>()? {
            Isa::Arm | Isa::Arm64 => Self { isa32: Some(Isa::Arm), isa64: Isa::Arm64 },
            Isa::X86 | Isa::X86_64 => Self { isa32: Some(Isa::X86), isa64: Isa::X86_64 },
            Isa::Riscv64 => Self { isa32: None, isa64: Isa::Riscv64 },
        })
    }
}

/// Which zygote processes the device starts, and in which order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZygoteKind {
    /// 32-bit only.
    Zygote32,
    /// 32-bit primary, 64-bit secondary.
    Zygote32_64,
    /// 64-bit primary, 32-bit secondary.
    Zygote64_32,
    /// 64-bit only.
    Zygote64,
}

impl FromStr for ZygoteKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "zygote32" => Self::Zygote32,
            "zygote32_64" => Self::Zygote32_64,
            "zygote64_32" => Self::Zygote64_32,
            "zygote64" => Self::Zygote64,
            other => bail!("unknown zygote kind '{other}'"),
        })
    }
}

impl ZygoteKind {
    /// Boot classpath instruction sets, primary first.
    ///
    /// # Errors
    ///
    /// Fails when a 32-bit zygote is requested on a 64-bit-only family.
    pub fn boot_classpath_isas(self, pair: IsaPair) -> Result<Vec<Isa>> {
        let isa32 = || match pair.isa32 {
            Some(isa) => Ok(isa),
            None => bail!("{:?} needs a 32-bit instruction set, {} has none", self, pair.isa64),
        };
        Ok(match self {
            Self::Zygote32 => vec![isa32()?],
            Self::Zygote32_64 => vec![isa32()?, pair.isa64],
            Self::Zygote64_32 => vec![pair.isa64, isa32()?],
            Self::Zygote64 => vec![pair.isa64],
        })
    }

    /// The instruction set system server runs with.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::boot_classpath_isas`].
    pub fn system_server_isa(self, pair: IsaPair) -> Result<Isa> {
        let isas = self.boot_classpath_isas(pair)?;
        Ok(isas[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm() -> IsaPair {
        "arm64".parse().unwrap()
    }

    #[test]
    fn zygote_order_selects_primary_isa() {
        assert_eq!(
            ZygoteKind::Zygote64_32.boot_classpath_isas(arm()).unwrap(),
            vec![Isa::Arm64, Isa::Arm]
        );
        assert_eq!(
            ZygoteKind::Zygote32_64.boot_classpath_isas(arm()).unwrap(),
            vec![Isa::Arm, Isa::Arm64]
        );
        assert_eq!(ZygoteKind::Zygote64.system_server_isa(arm()).unwrap(), Isa::Arm64);
        assert_eq!(ZygoteKind::Zygote32_64.system_server_isa(arm()).unwrap(), Isa::Arm);
    }

    #[test]
    fn riscv_has_no_32_bit_zygote() {
        let pair: IsaPair = "riscv64".parse().unwrap();
        assert!(ZygoteKind::Zygote64_32.boot_classpath_isas(pair).is_err());
        assert_eq!(ZygoteKind::Zygote64.boot_classpath_isas(pair).unwrap(), vec![Isa::Riscv64]);
    }

    #[test]
    fn isa_names_round_trip_through_parse() {
        for isa in [Isa::Arm, Isa::Arm64, Isa::X86, Isa::X86_64, Isa::Riscv64] {
            assert_eq!(isa.as_str().parse::<Isa>().unwrap(), isa);
        }
        assert!("mips".parse::<Isa>().is_err());
    }
}

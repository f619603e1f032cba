use serde::Deserialize;
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Numeric base used to render register values.
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, Default, EnumString, Display, IntoStaticStr, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RegisterFormat {
    Hex,
    Oct,
    #[default]
    Dec,
    Bin,
}

impl RegisterFormat {
    pub fn prefix(self) -> &'static str {
        match self {
            RegisterFormat::Hex => "0x",
            RegisterFormat::Oct => "0o",
            RegisterFormat::Dec => "",
            RegisterFormat::Bin => "0b",
        }
    }

    /// Minimum digit count, shorter values are left-padded with `0`.
    pub fn width(self) -> usize {
        match self {
            RegisterFormat::Hex => 8,
            RegisterFormat::Oct => 11,
            RegisterFormat::Dec => 10,
            RegisterFormat::Bin => 32,
        }
    }
}

/// Render a 32-bit register value.
///
/// Values are rendered as their unsigned 32-bit pattern, so `-1` in hex is
/// `0xffffffff` and never carries a sign.
pub fn format_register(value: i32, format: RegisterFormat) -> String {
    let bits = value as u32;
    let width = format.width();
    let digits = match format {
        RegisterFormat::Hex => format!("{bits:0width$x}"),
        RegisterFormat::Oct => format!("{bits:0width$o}"),
        RegisterFormat::Dec => format!("{bits:0width$}"),
        RegisterFormat::Bin => format!("{bits:0width$b}"),
    };
    format!("{}{digits}", format.prefix())
}

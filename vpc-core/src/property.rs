//! Property table
//!
//! Maps the fixed set of property names accepted on the configuration
//! boundary to driver commands. Names and values are fully checked here so
//! a rejected request never costs a serializer turn.

use std::str::FromStr;

use vpc_error::{Result, VpcError};
use vpc_protocol::{validate_ec_register, EcRegister, PropertyValue};

use crate::platform::{Feature, PlatformProfile, ToggleKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    Toggle(Feature),
    ReadEc,
    WriteEc,
    VpcConfig,
    Reset,
    Update,
}

impl Property {
    pub fn name(&self) -> &'static str {
        match self {
            Property::Toggle(feature) => feature.property(),
            Property::ReadEc => "ReadEC",
            Property::WriteEc => "WriteEC",
            Property::VpcConfig => "VPCconfig",
            Property::Reset => "reset",
            Property::Update => "Update",
        }
    }

    /// Every accepted property name
    pub fn names() -> Vec<&'static str> {
        Feature::ALL
            .iter()
            .map(Feature::property)
            .chain(["ReadEC", "WriteEC", "VPCconfig", "reset", "Update"])
            .collect()
    }
}

impl FromStr for Property {
    type Err = VpcError;

    fn from_str(name: &str) -> Result<Self> {
        if let Some(feature) = Feature::from_property(name) {
            return Ok(Property::Toggle(feature));
        }
        match name {
            "ReadEC" => Ok(Property::ReadEc),
            "WriteEC" => Ok(Property::WriteEc),
            "VPCconfig" => Ok(Property::VpcConfig),
            "reset" => Ok(Property::Reset),
            "Update" => Ok(Property::Update),
            other => Err(VpcError::invalid(format!("unknown property {:?}", other))),
        }
    }
}

/// A validated request, ready to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Set(Feature, u32),
    /// Re-query a toggle and report its value
    Refresh(Feature),
    Flip(Feature),
    ReadEc(EcRegister),
    WriteEc(EcRegister),
    DumpConfig,
    Reset,
    Update,
}

/// Resolve a property name and value against the active profile
pub fn parse(name: &str, value: &PropertyValue, profile: &dyn PlatformProfile) -> Result<Command> {
    let property: Property = name.parse()?;

    match property {
        Property::Toggle(feature) => {
            let spec = profile.spec(feature).ok_or_else(|| {
                VpcError::method_missing(format!("{} ({} platform)", feature.property(), profile.name()))
            })?;

            if spec.set.is_none() {
                return Ok(Command::Refresh(feature));
            }

            match (value, spec.kind) {
                (PropertyValue::None, ToggleKind::Boolean) if feature == Feature::ClamshellMode => {
                    Ok(Command::Flip(feature))
                }
                (PropertyValue::None, _) => Err(VpcError::invalid(format!("{} requires a value", name))),
                (PropertyValue::Bool(b), ToggleKind::Boolean) => Ok(Command::Set(feature, u32::from(*b))),
                (PropertyValue::Int(v), ToggleKind::Boolean) if *v <= 1 => Ok(Command::Set(feature, *v)),
                (PropertyValue::Int(v), ToggleKind::Numeric { max }) if *v <= max => {
                    Ok(Command::Set(feature, *v))
                }
                (PropertyValue::Int(v), ToggleKind::Numeric { max }) => {
                    Err(VpcError::invalid(format!("{} accepts 0..={}, got {}", name, max, v)))
                }
                (other, _) => Err(VpcError::invalid(format!("{} cannot be set to {:?}", name, other))),
            }
        }
        Property::ReadEc => match value {
            PropertyValue::Register(reg) if reg.value.is_none() => {
                validate_ec_register(reg, false).map_err(VpcError::invalid)?;
                Ok(Command::ReadEc(*reg))
            }
            _ => Err(VpcError::invalid("ReadEC takes an offset and no value")),
        },
        Property::WriteEc => match value {
            PropertyValue::Register(reg) => {
                validate_ec_register(reg, true).map_err(VpcError::invalid)?;
                Ok(Command::WriteEc(*reg))
            }
            _ => Err(VpcError::invalid("WriteEC takes an offset and a value")),
        },
        Property::VpcConfig => Ok(Command::DumpConfig),
        Property::Reset => Ok(Command::Reset),
        Property::Update => Ok(Command::Update),
    }
}

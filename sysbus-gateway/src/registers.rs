//! Register map: the static mapping table and poll plan.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use sysbus_common::dpt;

use crate::codec::Frame;
use crate::config::{DataType, GatewayConfig, Space};
use crate::error::GatewayError;

/// A mapped register with its slave resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterDef {
    pub name: String,
    pub space: Space,
    pub address: u16,
    pub slave: u8,
    pub data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl RegisterDef {
    /// Interpret a raw word. `None` when the word carries no valid value.
    pub fn to_engineering(&self, raw: u16) -> Option<f64> {
        match self.data_type {
            DataType::U16 => Some(f64::from(raw)),
            DataType::I16 => Some(f64::from(raw as i16)),
            DataType::Dpt9001 => dpt::decode(raw),
        }
    }

    /// Convert an engineering value to the word written on the bus.
    pub fn to_raw(&self, value: f64) -> Result<u16, GatewayError> {
        if !value.is_finite() {
            return Err(self.invalid(format!("{} is not a number", value)));
        }
        self.check_bounds(value)?;

        match self.data_type {
            DataType::U16 => integer_in(value, 0.0, f64::from(u16::MAX))
                .map(|v| v as u16)
                .ok_or_else(|| self.invalid(format!("{} is not an integer in 0-65535", value))),
            DataType::I16 => integer_in(value, f64::from(i16::MIN), f64::from(i16::MAX))
                .map(|v| v as i16 as u16)
                .ok_or_else(|| {
                    self.invalid(format!("{} is not an integer in -32768-32767", value))
                }),
            DataType::Dpt9001 => dpt::encode(value).map_err(|e| self.invalid(e.to_string())),
        }
    }

    /// Check a raw word against the configured bounds.
    pub fn check_raw(&self, raw: u16) -> Result<(), GatewayError> {
        match self.to_engineering(raw) {
            Some(value) => self.check_bounds(value),
            None if self.min.is_some() || self.max.is_some() => {
                Err(self.invalid(format!("0x{:04X} carries no value", raw)))
            }
            None => Ok(()),
        }
    }

    fn check_bounds(&self, value: f64) -> Result<(), GatewayError> {
        if let Some(min) = self.min {
            if value < min {
                return Err(self.invalid(format!("{} is below the minimum {}", value, min)));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(self.invalid(format!("{} is above the maximum {}", value, max)));
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> GatewayError {
        GatewayError::InvalidValue {
            name: self.name.clone(),
            reason,
        }
    }
}

fn integer_in(value: f64, low: f64, high: f64) -> Option<f64> {
    (value.fract() == 0.0 && (low..=high).contains(&value)).then_some(value)
}

/// One range of the poll plan with its slave resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollRange {
    pub slave: u8,
    pub space: Space,
    pub start: u16,
    pub count: u16,
}

impl PollRange {
    /// Read request for this range.
    pub fn frame(&self) -> Frame {
        Frame::read(self.slave, self.space, self.start, self.count)
    }

    pub fn addresses(&self) -> impl Iterator<Item = u16> + use<> {
        let start = self.start;
        (0..self.count).map(move |offset| start + offset)
    }
}

impl std::fmt::Display for PollRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "slave {} {} {}+{}",
            self.slave, self.space, self.start, self.count
        )
    }
}

/// Points served together as one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointGroup {
    pub name: String,
    /// Field name to register name.
    pub members: BTreeMap<String, String>,
}

/// Lookup tables built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    registers: Vec<RegisterDef>,
    by_key: HashMap<(Space, u16), usize>,
    by_name: HashMap<String, usize>,
    plan: Vec<PollRange>,
    owners: HashMap<(Space, u16), u8>,
    groups: Vec<PointGroup>,
}

impl RegisterMap {
    /// Build the map from a validated configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let registers: Vec<RegisterDef> = config
            .registers
            .iter()
            .map(|r| RegisterDef {
                name: r.name.clone(),
                space: r.space,
                address: r.address,
                slave: config.bus.resolve_slave(r.slave),
                data_type: r.data_type,
                min: r.min,
                max: r.max,
                unit: r.unit.clone(),
            })
            .collect();

        let plan: Vec<PollRange> = config
            .poll_plan
            .iter()
            .map(|range| PollRange {
                slave: config.bus.resolve_slave(range.slave),
                space: range.space,
                start: range.start,
                count: range.count,
            })
            .collect();

        let groups = config
            .groups
            .iter()
            .map(|group| PointGroup {
                name: group.name.clone(),
                members: group.members.clone(),
            })
            .collect();

        Self::new(registers, plan).with_groups(groups)
    }

    pub fn new(registers: Vec<RegisterDef>, plan: Vec<PollRange>) -> Self {
        let mut by_key = HashMap::new();
        let mut by_name = HashMap::new();
        let mut owners = HashMap::new();

        for (index, register) in registers.iter().enumerate() {
            by_key.insert((register.space, register.address), index);
            by_name.insert(register.name.clone(), index);
            owners.insert((register.space, register.address), register.slave);
        }

        for range in &plan {
            for address in range.addresses() {
                owners.entry((range.space, address)).or_insert(range.slave);
            }
        }

        Self {
            registers,
            by_key,
            by_name,
            plan,
            owners,
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: Vec<PointGroup>) -> Self {
        self.groups = groups;
        self
    }

    pub fn group(&self, name: &str) -> Option<&PointGroup> {
        self.groups.iter().find(|group| group.name == name)
    }

    pub fn groups(&self) -> &[PointGroup] {
        &self.groups
    }

    /// Mapped register at an address.
    pub fn get(&self, space: Space, address: u16) -> Option<&RegisterDef> {
        self.by_key.get(&(space, address)).map(|&i| &self.registers[i])
    }

    /// Mapped register by name.
    pub fn by_name(&self, name: &str) -> Option<&RegisterDef> {
        self.by_name.get(name).map(|&i| &self.registers[i])
    }

    pub fn registers(&self) -> &[RegisterDef] {
        &self.registers
    }

    pub fn poll_plan(&self) -> &[PollRange] {
        &self.plan
    }

    /// Slave owning an address, if it is mapped or polled.
    pub fn slave_for(&self, space: Space, address: u16) -> Option<u8> {
        self.owners.get(&(space, address)).copied()
    }

    pub fn contains(&self, space: Space, address: u16) -> bool {
        self.owners.contains_key(&(space, address))
    }

    /// Every address the store mirrors, in order.
    pub fn store_keys(&self) -> Vec<(Space, u16)> {
        self.owners
            .keys()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, data_type: DataType, min: Option<f64>, max: Option<f64>) -> RegisterDef {
        RegisterDef {
            name: name.to_string(),
            space: Space::Holding,
            address: 1,
            slave: 240,
            data_type,
            min,
            max,
            unit: None,
        }
    }

    #[test]
    fn test_signed_and_unsigned_words() {
        let unsigned = def("u", DataType::U16, None, None);
        assert_eq!(unsigned.to_engineering(0xFFFF), Some(65535.0));
        assert_eq!(unsigned.to_raw(5.0).unwrap(), 5);
        assert!(unsigned.to_raw(-1.0).is_err());
        assert!(unsigned.to_raw(1.5).is_err());

        let signed = def("i", DataType::I16, None, None);
        assert_eq!(signed.to_engineering(0xFFFF), Some(-1.0));
        assert_eq!(signed.to_raw(-2.0).unwrap(), 0xFFFE);
        assert!(signed.to_raw(40000.0).is_err());
    }

    #[test]
    fn test_dpt_setpoint() {
        let setpoint = def("setpoint", DataType::Dpt9001, Some(5.0), Some(30.0));
        assert_eq!(setpoint.to_raw(21.0).unwrap(), 0x0C1A);
        assert!(setpoint.to_raw(35.0).is_err());
        assert!(setpoint.to_raw(f64::NAN).is_err());
        assert_eq!(setpoint.to_engineering(dpt::INVALID), None);

        assert!(setpoint.check_raw(0x0C1A).is_ok());
        assert!(setpoint.check_raw(dpt::INVALID).is_err());
    }

    #[test]
    fn test_bounds_on_raw_writes() {
        let mode = def("mode", DataType::U16, Some(1.0), Some(5.0));
        assert!(mode.check_raw(3).is_ok());
        assert!(matches!(
            mode.check_raw(9),
            Err(GatewayError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_map_lookups_and_keys() {
        let map = RegisterMap::new(
            vec![def("mode", DataType::U16, None, None)],
            vec![
                PollRange {
                    slave: 240,
                    space: Space::Input,
                    start: 0,
                    count: 3,
                },
                PollRange {
                    slave: 240,
                    space: Space::Holding,
                    start: 0,
                    count: 2,
                },
            ],
        );

        assert_eq!(map.by_name("mode").map(|r| r.address), Some(1));
        assert!(map.get(Space::Input, 1).is_none());
        assert_eq!(map.slave_for(Space::Input, 2), Some(240));
        assert!(!map.contains(Space::Input, 3));

        assert_eq!(
            map.store_keys(),
            vec![
                (Space::Input, 0),
                (Space::Input, 1),
                (Space::Input, 2),
                (Space::Holding, 0),
                (Space::Holding, 1),
            ]
        );
    }
}

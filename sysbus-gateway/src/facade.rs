//! API-facing gateway facade.
//!
//! Every call is answered from the register store; nothing here touches the
//! bus. Writes are queued in the store and picked up by the reconciler,
//! which is woken right away.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

use crate::config::Space;
use crate::error::GatewayError;
use crate::reconciler::{EngineStatus, Reconciler, SharedStatus};
use crate::registers::{PointGroup, RegisterDef, RegisterMap};
use crate::scheduler::{BusScheduler, BusStats};
use crate::store::{RegisterStore, StoreEntry};

/// A register as returned to API callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterValue {
    pub space: Space,
    pub address: u16,
    pub value: u16,
    /// Value queued by the API and not yet confirmed by the bus.
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A mapped register in engineering units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointValue {
    pub name: String,
    pub space: Space,
    pub address: u16,
    pub slave: u8,
    pub raw: u16,
    /// `None` when the raw word carries no valid value.
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<i64>,
}

/// The points of one group, keyed by field name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupValue {
    pub name: String,
    pub points: BTreeMap<String, PointValue>,
}

/// Bus and engine status.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub bus: BusStats,
    pub engine: EngineStatus,
}

/// Facade over the register store and map.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<RegisterStore>,
    map: Arc<RegisterMap>,
    bus: Arc<BusScheduler>,
    wake: Arc<Notify>,
    engine: SharedStatus,
}

impl Gateway {
    pub fn new(
        store: Arc<RegisterStore>,
        map: Arc<RegisterMap>,
        bus: Arc<BusScheduler>,
        reconciler: &Reconciler,
    ) -> Self {
        Self {
            store,
            map,
            bus,
            wake: reconciler.waker(),
            engine: reconciler.status(),
        }
    }

    /// Cached value of a register. Pending writes are visible immediately.
    pub async fn read_register(&self, space: Space, address: u16) -> Result<RegisterValue, GatewayError> {
        if !self.map.contains(space, address) {
            return Err(GatewayError::UnknownRegister { space, address });
        }

        let entry = self.entry(space, address).await;
        Ok(RegisterValue {
            space,
            address,
            value: entry.value,
            pending: entry.is_pending(),
            last_synced_at: entry.last_synced_at,
            name: self.map.get(space, address).map(|r| r.name.clone()),
        })
    }

    /// Queue a raw value for a holding register. Returns once the write is
    /// durable; the bus is updated by the next reconciler cycle.
    pub async fn write_register(
        &self,
        space: Space,
        address: u16,
        value: u16,
    ) -> Result<RegisterValue, GatewayError> {
        if !self.map.contains(space, address) {
            return Err(GatewayError::UnknownRegister { space, address });
        }
        if !space.is_writable() {
            return Err(GatewayError::ReadOnly { space, address });
        }
        if let Some(register) = self.map.get(space, address) {
            register.check_raw(value)?;
        }

        self.store.set_pending(space, address, value).await?;
        self.wake.notify_one();
        info!(%space, address, value, "Register write accepted");

        self.read_register(space, address).await
    }

    /// Engineering value of a named register.
    pub async fn read_point(&self, name: &str) -> Result<PointValue, GatewayError> {
        let register = self.point(name)?;
        Ok(self.point_value(register).await)
    }

    /// Convert, range-check and queue an engineering value.
    pub async fn write_point(&self, name: &str, value: f64) -> Result<PointValue, GatewayError> {
        let register = self.point(name)?;
        if !register.space.is_writable() {
            return Err(GatewayError::ReadOnly {
                space: register.space,
                address: register.address,
            });
        }

        let raw = register.to_raw(value)?;
        self.write_register(register.space, register.address, raw)
            .await?;

        Ok(self.point_value(register).await)
    }

    /// Every point of a group.
    pub async fn read_group(&self, name: &str) -> Result<GroupValue, GatewayError> {
        let group = self.group(name)?;

        let mut points = BTreeMap::new();
        for (field, register) in &group.members {
            let register = self.point(register)?;
            points.insert(field.clone(), self.point_value(register).await);
        }

        Ok(GroupValue {
            name: group.name.clone(),
            points,
        })
    }

    /// Queue engineering values for some fields of a group. Every value is
    /// checked before any of them is queued.
    pub async fn write_group(
        &self,
        name: &str,
        values: &BTreeMap<String, f64>,
    ) -> Result<GroupValue, GatewayError> {
        let group = self.group(name)?;
        if values.is_empty() {
            return Err(GatewayError::InvalidValue {
                name: group.name.clone(),
                reason: "no field given".to_string(),
            });
        }

        let mut writes = Vec::with_capacity(values.len());
        for (field, value) in values {
            let register = group
                .members
                .get(field)
                .ok_or_else(|| GatewayError::InvalidValue {
                    name: group.name.clone(),
                    reason: format!("no field '{}'", field),
                })
                .and_then(|register| self.point(register))?;

            if !register.space.is_writable() {
                return Err(GatewayError::ReadOnly {
                    space: register.space,
                    address: register.address,
                });
            }
            writes.push((register, register.to_raw(*value)?));
        }

        for (register, raw) in writes {
            self.write_register(register.space, register.address, raw)
                .await?;
        }

        self.read_group(name).await
    }

    /// Every configured group.
    pub fn groups(&self) -> &[PointGroup] {
        self.map.groups()
    }

    /// Every mapped register with its cached state.
    pub async fn registers(&self) -> Vec<PointValue> {
        let mut points = Vec::with_capacity(self.map.registers().len());
        for register in self.map.registers() {
            points.push(self.point_value(register).await);
        }
        points
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            bus: self.bus.stats(),
            engine: self.engine.read().clone(),
        }
    }

    fn point(&self, name: &str) -> Result<&RegisterDef, GatewayError> {
        self.map
            .by_name(name)
            .ok_or_else(|| GatewayError::UnknownPoint(name.to_string()))
    }

    fn group(&self, name: &str) -> Result<&PointGroup, GatewayError> {
        self.map
            .group(name)
            .ok_or_else(|| GatewayError::UnknownGroup(name.to_string()))
    }

    async fn entry(&self, space: Space, address: u16) -> StoreEntry {
        match self.store.entry(space, address).await {
            Some(entry) => entry,
            None => StoreEntry::unpopulated(space, address),
        }
    }

    async fn point_value(&self, register: &RegisterDef) -> PointValue {
        let entry = self.entry(register.space, register.address).await;
        PointValue {
            name: register.name.clone(),
            space: register.space,
            address: register.address,
            slave: register.slave,
            raw: entry.value,
            value: register.to_engineering(entry.value),
            unit: register.unit.clone(),
            pending: entry.is_pending(),
            last_synced_at: entry.last_synced_at,
        }
    }
}

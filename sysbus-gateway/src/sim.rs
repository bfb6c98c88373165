//! Simulated heating controller.
//!
//! Answers SysBus requests over any duplex stream, the way a base station
//! does on the real bus. Used for demo mode (`connection: { type:
//! "simulated" }`) and as the bus double in tests, which is why it can be
//! told to stay silent, corrupt its answers, or refuse writes.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use sysbus_common::dpt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::codec::{self, Frame, ILLEGAL_DATA_ADDRESS, ILLEGAL_FUNCTION};
use crate::config::Space;
use crate::error::DecodeError;

type Key = (u8, Space, u16);

#[derive(Default)]
struct SimState {
    registers: Mutex<HashMap<Key, u16>>,
    /// Slaves this controller answers for; empty answers every id.
    slaves: Mutex<HashSet<u8>>,
    /// Holding addresses whose writes are refused with an exception.
    refused: Mutex<HashSet<u16>>,
    /// Every decoded request, in arrival order.
    log: Mutex<Vec<Frame>>,
    latency: Mutex<Duration>,
    silent: AtomicBool,
    corrupt: AtomicUsize,
    requests: AtomicUsize,
    overlaps: AtomicUsize,
}

/// A device-side SysBus endpoint backed by an in-memory register map.
#[derive(Clone, Default)]
pub struct SimulatedController {
    state: Arc<SimState>,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller preloaded with the demo register layout shipped in
    /// `gateway.json5`.
    pub fn heating_controller() -> Self {
        let sim = Self::new().answer_only(&[240]);
        let temp = |value: f64| dpt::encode(value).unwrap_or(dpt::INVALID);

        // Outside temperature, filtered outside temperature, notifications
        sim.set(240, Space::Input, 0, temp(8.5));
        sim.set(240, Space::Input, 1, temp(9.0));
        sim.set(240, Space::Input, 2, 0);
        sim.set(240, Space::Input, 3, 1);
        sim.set(240, Space::Input, 4, 0);

        // Global mode and state
        sim.set(240, Space::Holding, 1, 1);
        sim.set(240, Space::Holding, 2, 2);

        // Zones 1 and 2: state, setpoint / temperature, humidity
        for (base, setpoint, measured, humidity) in [(100, 21.0, 20.5, 45), (110, 19.5, 19.8, 48)] {
            sim.set(240, Space::Holding, base, 1);
            sim.set(240, Space::Holding, base + 1, temp(setpoint));
            sim.set(240, Space::Input, base, temp(measured));
            sim.set(240, Space::Input, base + 1, humidity);
        }

        // Mixing circuit: pump on, valve at 35 %, flow and return temperatures
        sim.set(240, Space::Input, 200, 1);
        sim.set(240, Space::Input, 201, 35);
        sim.set(240, Space::Input, 202, temp(34.5));
        sim.set(240, Space::Input, 203, temp(29.0));

        // Dehumidifier off, extra pump on
        sim.set(240, Space::Input, 210, 0);
        sim.set(240, Space::Input, 220, 1);

        sim
    }

    /// Only answer requests addressed to these slave ids.
    pub fn answer_only(self, slaves: &[u8]) -> Self {
        *self.state.slaves.lock() = slaves.iter().copied().collect();
        self
    }

    /// Delay every answer by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock() = latency;
        self
    }

    pub fn set(&self, slave: u8, space: Space, address: u16, value: u16) {
        self.state
            .registers
            .lock()
            .insert((slave, space, address), value);
    }

    pub fn get(&self, slave: u8, space: Space, address: u16) -> u16 {
        self.state
            .registers
            .lock()
            .get(&(slave, space, address))
            .copied()
            .unwrap_or(0)
    }

    /// Stop answering (the request is still consumed and counted).
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Flip the CRC of the next `count` answers.
    pub fn corrupt_next(&self, count: usize) {
        self.state.corrupt.store(count, Ordering::SeqCst);
    }

    /// Refuse writes to a holding address with an exception.
    pub fn refuse_writes_to(&self, address: u16) {
        self.state.refused.lock().insert(address);
    }

    /// Requests received so far.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Requests that arrived before the previous one was answered.
    pub fn overlaps(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    /// Requests decoded so far, in arrival order.
    pub fn log(&self) -> Vec<Frame> {
        self.state.log.lock().clone()
    }

    /// Write requests decoded so far, in arrival order.
    pub fn writes(&self) -> Vec<Frame> {
        self.log()
            .into_iter()
            .filter(|frame| !frame.function.is_read())
            .collect()
    }

    /// Serve the device side of `io` until the peer closes it.
    pub fn serve<T>(&self, io: T) -> JoinHandle<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let sim = self.clone();
        tokio::spawn(async move {
            if let Err(e) = sim.serve_inner(io).await {
                debug!(error = %e, "Simulated controller stopped");
            }
        })
    }

    async fn serve_inner<T>(&self, mut io: T) -> std::io::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let len = loop {
                if let Some(len) = codec::request_len(&pending) {
                    if pending.len() >= len {
                        break len;
                    }
                }
                let n = io.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                pending.extend_from_slice(&chunk[..n]);
            };

            let request: Vec<u8> = pending.drain(..len).collect();
            self.state.requests.fetch_add(1, Ordering::SeqCst);

            let latency = *self.state.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            // Anything already queued was sent before this request was answered
            if let Ok(Ok(n)) = tokio::time::timeout(Duration::ZERO, io.read(&mut chunk)).await {
                if n == 0 {
                    return Ok(());
                }
                pending.extend_from_slice(&chunk[..n]);
            }
            if !pending.is_empty() {
                self.state.overlaps.fetch_add(1, Ordering::SeqCst);
            }

            if self.state.silent.load(Ordering::SeqCst) {
                continue;
            }

            let Some(mut response) = self.respond(&request) else {
                // Garbage or another slave's frame: resynchronize
                pending.clear();
                continue;
            };

            let corrupt = self.state.corrupt.load(Ordering::SeqCst);
            if corrupt > 0 {
                self.state.corrupt.store(corrupt - 1, Ordering::SeqCst);
                if let Some(last) = response.last_mut() {
                    *last ^= 0xFF;
                }
            }

            io.write_all(&response).await?;
            io.flush().await?;
        }
    }

    fn answers(&self, slave: u8) -> bool {
        let slaves = self.state.slaves.lock();
        slaves.is_empty() || slaves.contains(&slave)
    }

    fn respond(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let slave = *bytes.first()?;
        if !self.answers(slave) {
            return None;
        }

        let request = match codec::decode_request(bytes) {
            Ok(request) => request,
            Err(DecodeError::UnsupportedFunction(function)) => {
                return Some(codec::encode_exception(slave, function, ILLEGAL_FUNCTION));
            }
            Err(e) => {
                trace!(error = %e, "Simulated controller ignored frame");
                return None;
            }
        };

        self.state.log.lock().push(request.clone());

        let space = request.function.space();
        let addresses = (0..request.count).map(|offset| request.start.wrapping_add(offset));

        if request.function.is_read() {
            let registers = self.state.registers.lock();
            let payload = addresses
                .map(|address| {
                    registers
                        .get(&(slave, space, address))
                        .copied()
                        .unwrap_or(0)
                })
                .collect();
            return Some(codec::encode_response(&Frame { payload, ..request }));
        }

        {
            let refused = self.state.refused.lock();
            if addresses.clone().any(|address| refused.contains(&address)) {
                return Some(codec::encode_exception(
                    slave,
                    request.function.code(),
                    ILLEGAL_DATA_ADDRESS,
                ));
            }
        }

        {
            let mut registers = self.state.registers.lock();
            for (address, value) in addresses.zip(&request.payload) {
                registers.insert((slave, Space::Holding, address), *value);
            }
        }

        Some(codec::encode_response(&request))
    }
}

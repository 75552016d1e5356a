//! Real sensor backend for a Raspberry Pi.
//!
//! DS18B20 probes are read from the kernel's 1-Wire sysfs tree and work in
//! every build. The BH1750 light sensor and ADS1115 soil ADC sit on I2C bus 1
//! and need the `gpio` feature (rppal); without it they report
//! `unavailable`. The DHT22 needs microsecond bit-banging that the Linux
//! scheduler cannot guarantee, so it is expected to come from a remote node
//! and reports `unavailable` here.

use std::fs;
use std::path::{Path, PathBuf};

#[cfg(feature = "gpio")]
use std::{sync::Mutex, thread, time::Duration};

#[cfg(feature = "gpio")]
use rppal::i2c::I2c;

use crate::clock::Timestamp;
use crate::config::SensorSettings;
use crate::sensors::{
    ClimateReading, LightReading, ProbeReading, SensorBackend, SensorStatus, SoilReading,
};

// ── BH1750 ──────────────────────────────────────────────────────────────────

/// Continuous high-resolution mode (1 lx, 120 ms).
#[cfg(feature = "gpio")]
const BH1750_CONT_HRES: u8 = 0x10;
#[cfg(feature = "gpio")]
const BH1750_MEASURE_WAIT: Duration = Duration::from_millis(180);

/// The BH1750 answers on 0x23 or 0x5c depending on its ADDR pin; try the
/// other one when the configured address is silent.
#[cfg(feature = "gpio")]
fn bh1750_candidates(primary: u16) -> Vec<u16> {
    match primary {
        0x23 => vec![0x23, 0x5c],
        0x5c => vec![0x5c, 0x23],
        other => vec![other],
    }
}

pub fn bh1750_lux(msb: u8, lsb: u8) -> f64 {
    let raw = u16::from_be_bytes([msb, lsb]) as f64 / 1.2;
    (raw * 10.0).round() / 10.0
}

// ── ADS1115 ─────────────────────────────────────────────────────────────────

#[cfg(feature = "gpio")]
const REG_CONVERSION: u8 = 0x00;
#[cfg(feature = "gpio")]
const REG_CONFIG: u8 = 0x01;

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot), DR=100 (128 SPS),
/// COMP_QUE=11 (comparator off).
#[cfg(feature = "gpio")]
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;
#[cfg(feature = "gpio")]
const MUX_SHIFT: u8 = 12;
#[cfg(feature = "gpio")]
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];
#[cfg(feature = "gpio")]
const CONVERSION_WAIT: Duration = Duration::from_millis(9);
#[cfg(feature = "gpio")]
const OS_READY_BIT: u16 = 1 << 15;

#[cfg(feature = "gpio")]
fn ads_config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

// ── DS18B20 ─────────────────────────────────────────────────────────────────

/// Parse a `w1_slave` file: line 1 must end in `YES` (CRC ok), line 2 holds
/// `t=<millidegrees>`.
pub fn parse_w1_slave(contents: &str) -> Result<f64, SensorStatus> {
    let mut lines = contents.lines();
    let crc_line = lines.next().ok_or(SensorStatus::Error)?;
    if !crc_line.contains("YES") {
        return Err(SensorStatus::CrcError);
    }
    let data = lines.next().ok_or(SensorStatus::Error)?;
    let (_, raw) = data.rsplit_once("t=").ok_or(SensorStatus::Error)?;
    let milli: f64 = raw.trim().parse().map_err(|_| SensorStatus::Error)?;
    Ok(milli / 1000.0)
}

fn first_w1_device(base: &Path) -> Option<PathBuf> {
    let mut devices: Vec<PathBuf> = fs::read_dir(base)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("28-"))
        .map(|e| e.path().join("w1_slave"))
        .filter(|p| p.exists())
        .collect();
    devices.sort();
    devices.into_iter().next()
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct HardwareSensors {
    settings: SensorSettings,
    #[cfg(feature = "gpio")]
    bus: Mutex<Option<I2c>>,
}

impl HardwareSensors {
    pub fn new(settings: SensorSettings) -> Self {
        #[cfg(feature = "gpio")]
        let bus = match I2c::new() {
            Ok(bus) => Some(bus),
            Err(e) => {
                tracing::warn!("i2c bus unavailable: {e}");
                None
            }
        };

        Self {
            settings,
            #[cfg(feature = "gpio")]
            bus: Mutex::new(bus),
        }
    }

    #[cfg(feature = "gpio")]
    fn with_bus<T>(&self, f: impl FnOnce(&mut I2c) -> rppal::i2c::Result<T>) -> Option<rppal::i2c::Result<T>> {
        let mut guard = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_mut().map(f)
    }

    #[cfg(feature = "gpio")]
    fn read_ads_channel(i2c: &mut I2c, channel: usize) -> rppal::i2c::Result<i16> {
        i2c.block_write(REG_CONFIG, &ads_config_for_channel(channel).to_be_bytes())?;
        thread::sleep(CONVERSION_WAIT);
        for _ in 0..3 {
            let mut buf = [0u8; 2];
            i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let mut buf = [0u8; 2];
        i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }
}

impl SensorBackend for HardwareSensors {
    fn read_dht22(&self, now: Timestamp) -> ClimateReading {
        ClimateReading::failed(now, SensorStatus::Unavailable)
    }

    fn read_ds18b20(&self, now: Timestamp) -> ProbeReading {
        if !self.settings.ds18b20_enabled {
            return ProbeReading::failed(now, SensorStatus::Disabled);
        }
        let Some(path) = first_w1_device(&self.settings.w1_base) else {
            return ProbeReading::failed(now, SensorStatus::Missing);
        };
        let parsed = fs::read_to_string(&path)
            .map_err(|_| SensorStatus::Error)
            .and_then(|c| parse_w1_slave(&c));
        match parsed {
            Ok(t) => ProbeReading {
                temperature: Some(t),
                ts: now,
                status: SensorStatus::Ok,
            },
            Err(status) => ProbeReading::failed(now, status),
        }
    }

    #[cfg(feature = "gpio")]
    fn read_bh1750(&self, now: Timestamp) -> LightReading {
        for addr in bh1750_candidates(self.settings.bh1750_addr) {
            let result = self.with_bus(|i2c| {
                i2c.set_slave_address(addr)?;
                i2c.write(&[BH1750_CONT_HRES])?;
                thread::sleep(BH1750_MEASURE_WAIT);
                let mut buf = [0u8; 2];
                i2c.read(&mut buf)?;
                Ok(buf)
            });
            match result {
                None => return LightReading::failed(now, SensorStatus::Unavailable),
                Some(Ok([msb, lsb])) => {
                    return LightReading {
                        lux: Some(bh1750_lux(msb, lsb)),
                        ts: now,
                        status: SensorStatus::Ok,
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(addr = format_args!("0x{addr:02x}"), "bh1750 read failed: {e}");
                }
            }
        }
        LightReading::failed(now, SensorStatus::Error)
    }

    #[cfg(not(feature = "gpio"))]
    fn read_bh1750(&self, now: Timestamp) -> LightReading {
        LightReading::failed(now, SensorStatus::Unavailable)
    }

    #[cfg(feature = "gpio")]
    fn read_soil(&self, now: Timestamp) -> SoilReading {
        let addr = self.settings.ads1115_addr;
        let result = self.with_bus(|i2c| {
            i2c.set_slave_address(addr)?;
            let mut channels = [None; 4];
            for (ch, slot) in channels.iter_mut().enumerate() {
                let raw = Self::read_ads_channel(i2c, ch)?;
                *slot = Some((raw as f64).clamp(0.0, 32767.0));
            }
            Ok(channels)
        });
        match result {
            None => SoilReading::failed(now, SensorStatus::Unavailable),
            Some(Ok(channels)) => SoilReading {
                channels,
                ts: now,
                status: SensorStatus::Ok,
            },
            Some(Err(e)) => {
                tracing::warn!(addr = format_args!("0x{addr:02x}"), "ads1115 read failed: {e}");
                SoilReading::failed(now, SensorStatus::Error)
            }
        }
    }

    #[cfg(not(feature = "gpio"))]
    fn read_soil(&self, now: Timestamp) -> SoilReading {
        SoilReading::failed(now, SensorStatus::Unavailable)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! A packet sink that tabulates the datafeed with polars.
//!
//! Analog values land in one long table (a row per value), logic samples in
//! a wide table per device (a boolean column per logic channel).

use crate::analog::Analog;
use crate::datafeed::Packet;
use crate::device::{ChannelType, DeviceId, DeviceInfo};
use crate::logic::Logic;
use crate::pipeline::PacketSink;
use polars::prelude::*;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

const DEVICE_COLUMN_NAME: &str = "device";
const FRAME_COLUMN_NAME: &str = "frame";
const CHANNEL_COLUMN_NAME: &str = "channel";
const QUANTITY_COLUMN_NAME: &str = "quantity";
const UNIT_COLUMN_NAME: &str = "unit";
const VALUE_COLUMN_NAME: &str = "value";
const SAMPLE_COLUMN_NAME: &str = "sample";

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No logic data from device {0}")]
    NoLogic(DeviceId),
}

#[derive(Debug, Default)]
struct AnalogRows {
    device: Vec<u64>,
    frame: Vec<Option<u32>>,
    channel: Vec<String>,
    quantity: Vec<&'static str>,
    unit: Vec<String>,
    value: Vec<f64>,
}

#[derive(Debug, Default)]
struct LogicColumns {
    names: Vec<String>,
    bits: Vec<Vec<bool>>,
}

#[derive(Debug, Default)]
struct FrameState {
    current: Option<u32>,
    seen: u32,
}

#[derive(Debug, Default)]
struct Tables {
    analog: AnalogRows,
    logic: BTreeMap<DeviceId, LogicColumns>,
    frames: BTreeMap<DeviceId, FrameState>,
}

/// Collects packets into tables. Clones share the same tables, so one clone
/// can go to the session while another is kept for reading.
#[derive(Debug, Clone, Default)]
pub struct TableSink {
    tables: Rc<RefCell<Tables>>,
}

/// Splits bit-packed samples into one column per channel.
fn extract_bits(logic: &Logic, num_channels: usize, columns: &mut [Vec<bool>]) {
    for sample in logic.samples().iter() {
        for (bit, column) in columns.iter_mut().enumerate().take(num_channels) {
            let value = sample.get(bit / 8).is_some_and(|byte| (byte >> (bit % 8)) & 1 == 1);
            column.push(value);
        }
    }
}

impl Tables {
    fn add_analog(&mut self, device: &DeviceInfo, analog: &Analog) {
        let values = match analog.to_f32() {
            Ok(values) => values,
            Err(e) => {
                log::debug!("Table sink skips an analog packet from {device}: {e}");
                return;
            }
        };
        let frame = self.frames.get(&device.id).and_then(|f| f.current);
        let channel = analog
            .meaning
            .channels
            .iter()
            .filter_map(|index| device.channel(*index))
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let unit = analog.unit_string();

        let rows = &mut self.analog;
        for value in values {
            rows.device.push(device.id);
            rows.frame.push(frame);
            rows.channel.push(channel.clone());
            rows.quantity.push(analog.meaning.mq.as_str());
            rows.unit.push(unit.clone());
            rows.value.push(f64::from(value));
        }
    }

    fn add_logic(&mut self, device: &DeviceInfo, logic: &Logic) {
        let columns = self.logic.entry(device.id).or_insert_with(|| {
            let names: Vec<String> = device
                .channels_of(ChannelType::Logic)
                .map(|c| c.name.clone())
                .collect();
            LogicColumns {
                bits: vec![Vec::new(); names.len()],
                names,
            }
        });
        let num_channels = columns.names.len().min(logic.unitsize() * 8);
        extract_bits(logic, num_channels, &mut columns.bits);
    }
}

impl PacketSink for TableSink {
    fn receive(&mut self, device: &DeviceInfo, packet: &Packet) {
        let mut tables = self.tables.borrow_mut();
        match packet {
            Packet::Analog(analog) => tables.add_analog(device, analog),
            Packet::Logic(logic) => tables.add_logic(device, logic),
            Packet::FrameBegin => {
                let state = tables.frames.entry(device.id).or_default();
                state.current = Some(state.seen);
                state.seen += 1;
            }
            Packet::FrameEnd => {
                if let Some(state) = tables.frames.get_mut(&device.id) {
                    state.current = None;
                }
            }
            _ => {}
        }
    }
}

impl TableSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        *self.tables.borrow_mut() = Tables::default();
    }

    /// Number of analog values collected so far.
    pub fn analog_len(&self) -> usize {
        self.tables.borrow().analog.value.len()
    }

    /// Every analog value as a row of
    /// `device, frame, channel, quantity, unit, value`.
    pub fn analog_frame(&self) -> Result<DataFrame, TableError> {
        let tables = self.tables.borrow();
        let rows = &tables.analog;
        let columns: Vec<Column> = vec![
            Series::new(DEVICE_COLUMN_NAME.into(), &rows.device).into(),
            Series::new(FRAME_COLUMN_NAME.into(), &rows.frame).into(),
            Series::new(CHANNEL_COLUMN_NAME.into(), &rows.channel).into(),
            Series::new(QUANTITY_COLUMN_NAME.into(), &rows.quantity).into(),
            Series::new(UNIT_COLUMN_NAME.into(), &rows.unit).into(),
            Series::new(VALUE_COLUMN_NAME.into(), &rows.value).into(),
        ];
        Ok(DataFrame::new(columns)?)
    }

    /// Logic samples of one device: a `sample` index column, then one
    /// boolean column per logic channel.
    pub fn logic_frame(&self, device: DeviceId) -> Result<DataFrame, TableError> {
        let tables = self.tables.borrow();
        let logic = tables.logic.get(&device).ok_or(TableError::NoLogic(device))?;
        let len = logic.bits.first().map_or(0, Vec::len) as u64;

        let mut df = DataFrame::new(vec![
            Series::new(SAMPLE_COLUMN_NAME.into(), (0..len).collect::<Vec<u64>>()).into(),
        ])?;
        for (name, values) in logic.names.iter().zip(&logic.bits) {
            let column: Column = Series::new(name.as_str().into(), values).into();
            df.with_column(column)?;
        }
        Ok(df)
    }

    /// Count, min, max and mean per device and channel, in order of first
    /// appearance.
    pub fn summary(&self) -> Result<DataFrame, TableError> {
        let df = self
            .analog_frame()?
            .lazy()
            .group_by_stable([
                col(DEVICE_COLUMN_NAME),
                col(CHANNEL_COLUMN_NAME),
                col(QUANTITY_COLUMN_NAME),
                col(UNIT_COLUMN_NAME),
            ])
            .agg([
                col(VALUE_COLUMN_NAME).count().alias("count"),
                col(VALUE_COLUMN_NAME).min().alias("min"),
                col(VALUE_COLUMN_NAME).max().alias("max"),
                col(VALUE_COLUMN_NAME).mean().alias("mean"),
            ])
            .collect()?;
        Ok(df)
    }

    pub fn write_analog_csv(&self, path: impl AsRef<Path>) -> Result<(), TableError> {
        let mut df = self.analog_frame()?;
        write_csv(&mut df, path.as_ref())
    }

    pub fn write_logic_csv(&self, device: DeviceId, path: impl AsRef<Path>) -> Result<(), TableError> {
        let mut df = self.logic_frame(device)?;
        write_csv(&mut df, path.as_ref())
    }
}

fn write_csv(df: &mut DataFrame, path: &Path) -> Result<(), TableError> {
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    log::info!("Wrote {} rows to {}.", df.height(), path.display());
    Ok(())
}

//! Fixed binary layouts of the Neuralynx record types.
//!
//! Every record is a packed, little-endian sequence of fields. A
//! [`RecordLayout`] lists those fields with their offsets so decoders look
//! fields up by name instead of hard-coding byte positions.

use byteorder::{ByteOrder, LittleEndian};

use crate::types::*;

/// Version of the layouts defined here.
pub const SCHEMA_VERSION: u16 = 1;

/// Sample slots in every continuous-signal packet.
pub const SAMPLES_PER_PACKET: usize = 512;
/// Width of the event label field.
pub const EVENT_LABEL_BYTES: usize = 128;
/// Extra words carried by event records.
pub const EVENT_EXTRA_WORDS: usize = 8;
/// Feature slots in a spike record.
pub const SPIKE_FEATURES: usize = 8;
/// Waveform samples in a spike record.
pub const SPIKE_WAVEFORM_SAMPLES: usize = 32;
/// Extra words carried by raw packets, between the TTL word and the samples.
pub const RAW_EXTRA_WORDS: usize = 10;

/// Start-of-frame marker of a raw packet.
pub const RAW_STX: u32 = 0x0000_0800;
/// Packet id carried by every raw data packet.
pub const RAW_PACKET_ID: i32 = 1;

/// Numeric type of a field element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    I16,
    U16,
    I32,
    U32,
    U64,
    Byte,
}

impl FieldKind {
    /// Size in bytes of one element.
    pub const fn size(self) -> usize {
        match self {
            FieldKind::Byte => 1,
            FieldKind::I16 | FieldKind::U16 => 2,
            FieldKind::I32 | FieldKind::U32 => 4,
            FieldKind::U64 => 8,
        }
    }
}

/// One field of a record: `count` consecutive elements of `kind` at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
    pub count: usize,
}

impl FieldDescriptor {
    /// Total width of the field in bytes.
    pub fn width(&self) -> usize {
        self.kind.size() * self.count
    }

    fn at(&self, index: usize) -> usize {
        debug_assert!(index < self.count, "{}[{}] out of bounds", self.name, index);
        self.offset + index * self.kind.size()
    }

    pub fn read_i16(&self, record: &[u8], index: usize) -> i16 {
        LittleEndian::read_i16(&record[self.at(index)..])
    }

    pub fn read_u16(&self, record: &[u8], index: usize) -> u16 {
        LittleEndian::read_u16(&record[self.at(index)..])
    }

    pub fn read_i32(&self, record: &[u8], index: usize) -> i32 {
        LittleEndian::read_i32(&record[self.at(index)..])
    }

    pub fn read_u32(&self, record: &[u8], index: usize) -> u32 {
        LittleEndian::read_u32(&record[self.at(index)..])
    }

    pub fn read_u64(&self, record: &[u8], index: usize) -> u64 {
        LittleEndian::read_u64(&record[self.at(index)..])
    }

    /// The raw bytes of the whole field.
    pub fn bytes<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        &record[self.offset..self.offset + self.width()]
    }
}

/// The record types found in recorder files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `.ncs`
    Continuous,
    /// `.nev`
    Event,
    /// `.nse`
    Spike,
    /// `.nrd`
    Raw,
}

impl RecordKind {
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Continuous => "continuous",
            RecordKind::Event => "event",
            RecordKind::Spike => "spike",
            RecordKind::Raw => "raw",
        }
    }
}

/// Field-by-field description of a fixed-size record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    kind: RecordKind,
    version: u16,
    fields: Vec<FieldDescriptor>,
    size: usize,
}

impl RecordLayout {
    /// Packs the given fields back to back, in order.
    fn packed(kind: RecordKind, fields: &[(&'static str, FieldKind, usize)]) -> Self {
        let mut offset = 0;
        let descriptors = fields
            .iter()
            .map(|&(name, kind, count)| {
                let field = FieldDescriptor {
                    name,
                    offset,
                    kind,
                    count,
                };
                offset += field.width();
                field
            })
            .collect();

        RecordLayout {
            kind,
            version: SCHEMA_VERSION,
            fields: descriptors,
            size: offset,
        }
    }

    /// Continuous-signal packet (1044 bytes).
    pub fn continuous() -> Self {
        Self::packed(
            RecordKind::Continuous,
            &[
                ("timestamp", FieldKind::U64, 1),
                ("channel", FieldKind::U32, 1),
                ("sampling_rate", FieldKind::U32, 1),
                ("valid_sample_count", FieldKind::U32, 1),
                ("samples", FieldKind::I16, SAMPLES_PER_PACKET),
            ],
        )
    }

    /// Event record (184 bytes).
    pub fn event() -> Self {
        Self::packed(
            RecordKind::Event,
            &[
                ("stx", FieldKind::I16, 1),
                ("packet_id", FieldKind::I16, 1),
                ("packet_data_size", FieldKind::I16, 1),
                ("timestamp", FieldKind::U64, 1),
                ("event_id", FieldKind::I16, 1),
                ("ttl", FieldKind::U16, 1),
                ("crc", FieldKind::I16, 1),
                ("dummy1", FieldKind::I16, 1),
                ("dummy2", FieldKind::I16, 1),
                ("extra", FieldKind::I32, EVENT_EXTRA_WORDS),
                ("label", FieldKind::Byte, EVENT_LABEL_BYTES),
            ],
        )
    }

    /// Single-electrode spike record (112 bytes).
    pub fn spike() -> Self {
        Self::packed(
            RecordKind::Spike,
            &[
                ("timestamp", FieldKind::U64, 1),
                ("acquisition_entity", FieldKind::U32, 1),
                ("cell_number", FieldKind::U32, 1),
                ("features", FieldKind::U32, SPIKE_FEATURES),
                ("waveform", FieldKind::I16, SPIKE_WAVEFORM_SAMPLES),
            ],
        )
    }

    /// Raw multiplexed packet for a system with `channel_count` A/D channels.
    ///
    /// Every field is a 32-bit word, so the packet can be checksummed word by word.
    pub fn raw(channel_count: usize) -> Self {
        Self::packed(
            RecordKind::Raw,
            &[
                ("stx", FieldKind::I32, 1),
                ("packet_id", FieldKind::I32, 1),
                ("packet_data_size", FieldKind::I32, 1),
                ("timestamp_high", FieldKind::U32, 1),
                ("timestamp_low", FieldKind::U32, 1),
                ("status", FieldKind::I32, 1),
                ("ttl", FieldKind::U32, 1),
                ("extra", FieldKind::I32, RAW_EXTRA_WORDS),
                ("data", FieldKind::I32, channel_count),
                ("crc", FieldKind::I32, 1),
            ],
        )
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// Record size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &'static str) -> Result<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or(LynxError::MissingField {
                layout: self.kind.name(),
                field: name,
            })
    }
}

//! Channel database: services and multiplexes.

use tunerdb_store::{DatabaseSchema, Record};
use tunerdb_types::{
    CodecError, FieldType, Wire,
    codec::{deserialize, read_variant, wire::PREFIX_SIZE, write_variant},
};

/// Database name.
pub const NAME: &str = "chdb";

/// Variant tag of [`Delivery`] in schema descriptors.
const DELIVERY_TAG: u32 = 1;

const DVBS_TAG: u32 = 1;
const DVBC_TAG: u32 = 2;
const DVBT_TAG: u32 = 3;

tunerdb_types::wire_struct! {
    /// Satellite tuning parameters (DVB-S/S2).
    pub struct DvbS: 11 {
        /// Frequency in kHz.
        frequency: u32,
        /// Symbol rate in symbols per second.
        symbol_rate: u32,
        /// 0 = H, 1 = V, 2 = L, 3 = R.
        polarisation: u8,
        /// FEC code as signalled in the satellite delivery descriptor.
        fec: u8,
        /// Modulation as signalled in the satellite delivery descriptor.
        modulation: u8,
        /// Roll-off factor code.
        rolloff: u8,
        /// Multistream id, -1 when not used.
        stream_id: i16,
    }
}

tunerdb_types::wire_struct! {
    /// Cable tuning parameters (DVB-C).
    pub struct DvbC: 12 {
        /// Frequency in kHz.
        frequency: u32,
        /// Symbol rate in symbols per second.
        symbol_rate: u32,
        /// QAM constellation code.
        modulation: u8,
        /// Inner FEC code.
        fec_inner: u8,
    }
}

tunerdb_types::wire_struct! {
    /// Terrestrial tuning parameters (DVB-T/T2).
    pub struct DvbT: 13 {
        /// Centre frequency in kHz.
        frequency: u32,
        /// Channel bandwidth in Hz.
        bandwidth: u32,
        /// Constellation code.
        modulation: u8,
        /// Guard interval code.
        guard_interval: u8,
        /// Transmission mode code.
        transmission_mode: u8,
        /// T2 physical layer pipe, -1 when not used.
        plp_id: i16,
    }
}

/// How a multiplex is received.
///
/// Alternatives written by a newer build that this one does not know are kept as
/// [`Delivery::Unknown`] and written back unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// DVB-S/S2.
    Satellite(DvbS),
    /// DVB-C.
    Cable(DvbC),
    /// DVB-T/T2.
    Terrestrial(DvbT),
    /// An alternative this build does not know.
    Unknown {
        /// Alternative tag as stored.
        tag: u32,
        /// Serialized alternative.
        payload: Vec<u8>,
    },
}

impl Default for Delivery {
    fn default() -> Self {
        Self::Unknown { tag: 0, payload: Vec::new() }
    }
}

impl Delivery {
    /// Frequency in kHz, if known.
    pub fn frequency(&self) -> Option<u32> {
        match self {
            Self::Satellite(s) => Some(s.frequency),
            Self::Cable(c) => Some(c.frequency),
            Self::Terrestrial(t) => Some(t.frequency),
            Self::Unknown { .. } => None,
        }
    }

    fn tag(&self) -> u32 {
        match self {
            Self::Satellite(_) => DVBS_TAG,
            Self::Cable(_) => DVBC_TAG,
            Self::Terrestrial(_) => DVBT_TAG,
            Self::Unknown { tag, .. } => *tag,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Self::Satellite(s) => s.serialized_size(),
            Self::Cable(c) => c.serialized_size(),
            Self::Terrestrial(t) => t.serialized_size(),
            Self::Unknown { payload, .. } => payload.len(),
        }
    }
}

impl Wire for Delivery {
    const FIELD_TYPE: FieldType = FieldType::Variant(DELIVERY_TAG);

    fn serialize(&self, out: &mut Vec<u8>) {
        write_variant(out, self.tag(), self.payload_size());
        match self {
            Self::Satellite(s) => s.serialize(out),
            Self::Cable(c) => c.serialize(out),
            Self::Terrestrial(t) => t.serialize(out),
            Self::Unknown { payload, .. } => out.extend_from_slice(payload),
        }
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let (tag, payload) = read_variant(buf)?;
        Ok(match tag {
            DVBS_TAG => Self::Satellite(deserialize(payload)?),
            DVBC_TAG => Self::Cable(deserialize(payload)?),
            DVBT_TAG => Self::Terrestrial(deserialize(payload)?),
            _ => Self::Unknown { tag, payload: payload.to_vec() },
        })
    }

    fn serialized_size(&self) -> usize {
        2 * PREFIX_SIZE + self.payload_size()
    }
}

tunerdb_store::define_record! {
    /// A multiplex (transport stream) on a satellite position or cable/terrestrial network.
    pub struct Mux {
        type_id: 2,
        name: "mux",
        primary_key: [1, 2, 3],
        indexes: [(1, "by_frequency", [1, 4])],
        fields: {
            /// Orbital position in 0.1 degree east, negative for west.
            1 => sat_pos: i16,
            /// Original network id.
            2 => network_id: u16,
            /// Transport stream id.
            3 => ts_id: u16,
            /// Frequency in kHz, duplicated from the tuning parameters for indexing.
            4 => frequency: u32,
            /// Tuning parameters.
            5 => delivery: Delivery,
            /// Last successful scan, seconds since the Unix epoch.
            6 => scan_time: i64,
            /// Services found in the last scan.
            7 => num_services: u16,
        }
    }
}

impl Mux {
    /// Builds a mux keyed by its tuning parameters' frequency.
    pub fn new(sat_pos: i16, network_id: u16, ts_id: u16, delivery: Delivery) -> Self {
        Self {
            sat_pos,
            network_id,
            ts_id,
            frequency: delivery.frequency().unwrap_or_default(),
            delivery,
            ..Self::default()
        }
    }
}

tunerdb_store::define_record! {
    /// A DVB service.
    pub struct Service {
        type_id: 1,
        name: "service",
        primary_key: [1, 2, 3, 4],
        indexes: [(1, "by_name", [5]), (2, "by_ch_order", [7])],
        fields: {
            /// Orbital position of the carrying mux.
            1 => sat_pos: i16,
            /// Original network id.
            2 => network_id: u16,
            /// Transport stream id.
            3 => ts_id: u16,
            /// Service id (programme number).
            4 => service_id: u16,
            /// Service name from the SDT.
            5 => name: String,
            /// Provider name from the SDT.
            6 => provider: String,
            /// User-visible channel number; `u32::MAX` sorts unnumbered services last.
            7 => ch_order: u32 = u32::MAX,
            /// Service type from the service descriptor.
            8 => service_type: u8,
            /// PMT pid.
            9 => pmt_pid: u16,
            /// Video pid, 0 when there is none.
            10 => video_pid: u16,
            /// Audio pids in PMT order.
            11 => audio_pids: Vec<u16>,
            /// Whether the service is scrambled.
            12 => encrypted: bool,
            /// Set when the service disappeared from the last scan.
            13 => expired: bool,
        }
    }
}

impl Service {
    /// Whether this is a radio service.
    pub fn is_radio(&self) -> bool {
        matches!(self.service_type, 0x02 | 0x07 | 0x0a)
    }

    /// Primary key of the mux carrying this service.
    pub fn mux_key(&self) -> Vec<u8> {
        Mux { sat_pos: self.sat_pos, network_id: self.network_id, ts_id: self.ts_id, ..Mux::default() }
            .primary_key()
    }
}

/// Schema of the channel database.
pub fn chdb_schema() -> DatabaseSchema {
    DatabaseSchema::new(NAME).with::<Service>().with::<Mux>()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use tunerdb_types::codec::serialize;

    use super::*;

    fn astra_mux() -> Mux {
        Mux::new(
            192,
            1,
            1019,
            Delivery::Satellite(DvbS {
                frequency: 11_494_000,
                symbol_rate: 22_000_000,
                polarisation: 0,
                fec: 3,
                modulation: 2,
                rolloff: 0,
                stream_id: -1,
            }),
        )
    }

    #[test]
    fn test_delivery_layout_is_tagged_and_sized() {
        let delivery = Delivery::Cable(DvbC { frequency: 346_000, symbol_rate: 6_900_000, modulation: 5, fec_inner: 0 });
        let bytes = serialize(&delivery);
        assert_eq!(bytes.len(), delivery.serialized_size());
        assert_eq!(&bytes[..4], &DVBC_TAG.to_be_bytes());
        assert_eq!(deserialize::<Delivery>(&bytes).unwrap(), delivery);
    }

    #[test]
    fn test_unknown_alternative_is_kept_verbatim() {
        let mut bytes = Vec::new();
        write_variant(&mut bytes, 42, 3);
        bytes.extend_from_slice(&[7, 8, 9]);
        let delivery = deserialize::<Delivery>(&bytes).unwrap();
        assert_eq!(delivery, Delivery::Unknown { tag: 42, payload: vec![7, 8, 9] });
        assert_eq!(delivery.frequency(), None);
        assert_eq!(serialize(&delivery), bytes);
    }

    #[test]
    fn test_mux_record_roundtrip() {
        let mux = astra_mux();
        assert_eq!(mux.frequency, 11_494_000);
        assert_eq!(Mux::decode(&mux.to_bytes()).unwrap(), mux);
    }

    #[test]
    fn test_service_mux_key() {
        let service = Service { sat_pos: 192, network_id: 1, ts_id: 1019, service_id: 28006, ..Service::default() };
        assert_eq!(service.mux_key(), astra_mux().primary_key());
        assert_eq!(service.ch_order, u32::MAX);
    }
}

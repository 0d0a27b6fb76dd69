//! Programme guide database.

use tunerdb_store::DatabaseSchema;

/// Database name.
pub const NAME: &str = "epgdb";

/// Event ids above this come from a non-DVB guide source.
const MAX_DVB_EVENT_ID: u32 = 0xffff;

tunerdb_store::define_record! {
    /// One programme guide event of a service.
    pub struct EpgRecord {
        type_id: 10,
        name: "epg",
        primary_key: [1, 2, 3, 4],
        indexes: [(1, "by_start_time", [1, 2, 3, 5])],
        fields: {
            /// Original network id of the service.
            1 => network_id: u16,
            /// Transport stream id of the service.
            2 => ts_id: u16,
            /// Service id.
            3 => service_id: u16,
            /// Event id. DVB event ids are 16 bits wide.
            4 => event_id: u32,
            /// Start, seconds since the Unix epoch.
            5 => start_time: i64,
            /// End, seconds since the Unix epoch.
            6 => end_time: i64,
            /// Event name.
            7 => title: String,
            /// Short description.
            8 => description: String,
            /// Minimum age, 0 when unrated.
            9 => parental_rating: u8,
            /// Content descriptor nibbles.
            10 => content: Vec<u8>,
        }
    }
}

impl EpgRecord {
    /// Whether `other` describes the same broadcast event of the same service.
    ///
    /// DVB events are matched by event id. An event id above `0xffff` marks a record from
    /// another guide source, whose ids are not stable, so those are matched by start time.
    pub fn is_same_event(&self, other: &Self) -> bool {
        if (self.network_id, self.ts_id, self.service_id)
            != (other.network_id, other.ts_id, other.service_id)
        {
            return false;
        }
        if self.event_id > MAX_DVB_EVENT_ID || other.event_id > MAX_DVB_EVENT_ID {
            self.start_time == other.start_time
        } else {
            self.event_id == other.event_id
        }
    }

    /// Event duration in seconds.
    pub fn duration(&self) -> i64 {
        (self.end_time - self.start_time).max(0)
    }
}

/// Schema of the programme guide database.
pub fn epgdb_schema() -> DatabaseSchema {
    DatabaseSchema::new(NAME).with::<EpgRecord>()
}

/// Replay-log records: one encounter per CSV record as
/// `timestamp,device_key,service_data,rssi`.
///
/// Timestamps are written as RFC 3339 in UTC with as many fractional
/// digits as needed, so a written log parses back to identical values.
/// Naive ISO-8601 timestamps (no offset) are read as UTC. Fields holding
/// delimiters, quotes or line breaks are quoted.
use std::io::{self, Read, Write};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use crate::encounter::Encounter;
use crate::error::ReplayError;

const FIELDS: usize = 4;

fn record_fields(encounter: &Encounter) -> [String; FIELDS] {
    [
        encounter
            .timestamp
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        encounter.device_key.clone(),
        encounter.service_data.clone(),
        encounter.rssi.to_string(),
    ]
}

/// Turn one CSV record into an encounter. `line` is only used in error
/// messages.
pub fn parse_record(record: &StringRecord, line: usize) -> Result<Encounter, ReplayError> {
    if record.len() != FIELDS {
        return Err(ReplayError::FieldCount {
            line,
            got: record.len(),
        });
    }

    let timestamp = parse_timestamp(&record[0]).ok_or_else(|| ReplayError::Timestamp {
        line,
        value: record[0].to_string(),
    })?;
    let rssi = record[3].trim().parse::<i16>().map_err(|_| ReplayError::Rssi {
        line,
        value: record[3].to_string(),
    })?;

    Ok(Encounter::new(&record[1], &record[2], timestamp, rssi))
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ── Writer ────────────────────────────────────────────────────────────

/// Appends encounters to a replay log, flushing after every record.
pub struct EncounterLogWriter<W: Write> {
    out: csv::Writer<W>,
}

impl<W: Write> EncounterLogWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: WriterBuilder::new().has_headers(false).from_writer(out),
        }
    }

    pub fn write(&mut self, encounter: &Encounter) -> csv::Result<()> {
        self.out.write_record(record_fields(encounter))?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.out
            .into_inner()
            .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string()))
    }
}

// ── Reader ────────────────────────────────────────────────────────────

/// Reads encounters back from a replay log, skipping records that do not
/// parse.
pub struct EncounterLogReader<R: Read> {
    reader: csv::Reader<R>,
    record: StringRecord,
    name: String,
}

impl<R: Read> EncounterLogReader<R> {
    pub fn new(input: R, name: impl Into<String>) -> Self {
        Self {
            reader: ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_reader(input),
            record: StringRecord::new(),
            name: name.into(),
        }
    }

    /// Lines consumed so far.
    pub fn lines(&self) -> u64 {
        self.reader.position().line()
    }

    /// Next well-formed encounter, or `None` at end of input. Only I/O
    /// failures are errors; malformed records are logged and skipped.
    pub fn next_encounter(&mut self) -> Result<Option<Encounter>, ReplayError> {
        loop {
            match self.reader.read_record(&mut self.record) {
                Ok(false) => return Ok(None),
                Ok(true) => {
                    let line = self.record.position().map_or(0, |p| p.line() as usize);
                    match parse_record(&self.record, line) {
                        Ok(encounter) => return Ok(Some(encounter)),
                        Err(e) => log::warn!("Skipping record in {}: {}", self.name, e),
                    }
                }
                Err(e) => match e.into_kind() {
                    csv::ErrorKind::Io(err) => return Err(ReplayError::Io(err)),
                    other => log::warn!("Skipping unreadable record in {}: {:?}", self.name, other),
                },
            }
        }
    }
}

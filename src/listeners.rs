/// Stock consumers of pipeline events: replay/device logs, a live device
/// table and a link report.
use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::PoisonError;
use std::time::{Duration, Instant};

use chrono::SecondsFormat;

use crate::dispatch::{Event, Listener};
use crate::linker::Link;
use crate::replay::EncounterLogWriter;
use crate::tracker::{Device, SharedTracker};

// ── Logs ──────────────────────────────────────────────────────────────

/// Appends every encounter to an encounters log (replay format) and the
/// first sighting of each `(key, service_data)` to a devices log.
pub struct LogListener<E: Write, D: Write> {
    encounters: Option<EncounterLogWriter<E>>,
    devices: Option<EncounterLogWriter<D>>,
    seen: HashSet<(String, String)>,
}

impl<E: Write, D: Write> LogListener<E, D> {
    pub fn new(encounters: Option<E>, devices: Option<D>) -> Self {
        Self {
            encounters: encounters.map(EncounterLogWriter::new),
            devices: devices.map(EncounterLogWriter::new),
            seen: HashSet::new(),
        }
    }

    pub fn into_parts(self) -> io::Result<(Option<E>, Option<D>)> {
        let encounters = self.encounters.map(EncounterLogWriter::into_inner).transpose()?;
        let devices = self.devices.map(EncounterLogWriter::into_inner).transpose()?;
        Ok((encounters, devices))
    }
}

impl<E: Write, D: Write> Listener for LogListener<E, D> {
    fn name(&self) -> &str {
        "log"
    }

    fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        let Event::Encounter(encounter) = event else {
            return Ok(());
        };
        if let Some(log) = self.encounters.as_mut() {
            log.write(encounter)?;
        }

        let key = (encounter.device_key.clone(), encounter.service_data.clone());
        if self.seen.insert(key) {
            if let Some(log) = self.devices.as_mut() {
                log.write(encounter)?;
            }
        }
        Ok(())
    }
}

// ── Device table ──────────────────────────────────────────────────────

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Redraws the tracked device table, at most once per `min_redraw`.
pub struct DeviceTableListener<W: Write> {
    out: W,
    tracker: SharedTracker,
    min_redraw: Duration,
    last_draw: Option<Instant>,
    clear: bool,
}

impl<W: Write> DeviceTableListener<W> {
    pub fn new(out: W, tracker: SharedTracker, min_redraw: Duration) -> Self {
        Self {
            out,
            tracker,
            min_redraw,
            last_draw: None,
            clear: true,
        }
    }

    /// Append tables instead of clearing the terminal before each one.
    pub fn without_clear(mut self) -> Self {
        self.clear = false;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn draw(&mut self) -> anyhow::Result<()> {
        let (mut devices, window) = {
            let tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            (tracker.snapshot(), tracker.config().rolling_window)
        };
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        if self.clear {
            self.out.write_all(CLEAR_SCREEN.as_bytes())?;
        }
        for device in &devices {
            if let Some(row) = render_row(device, window) {
                writeln!(self.out, "{row}")?;
            }
        }
        self.out.flush()?;
        Ok(())
    }
}

/// One table row, or `None` for a device without reads.
pub fn render_row(device: &Device, window: usize) -> Option<String> {
    let last = device.last_read()?;
    let first = device.first_read()?;
    let average = device.last_average_rssi(window)?;
    let interval = device
        .median_interval()
        .map_or_else(|| "-".to_string(), |d| format!("{}ms", d.num_milliseconds()));
    let presence = device.presence()?.num_seconds();

    Some(format!(
        "{} ({}): {} (avg {:.1}) (last: {}, first: {}, reads: {}, median interval: {}, present for {}s)",
        device.id.key,
        device.service_data,
        last.rssi,
        average,
        last.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        first.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        device.len(),
        interval,
        presence,
    ))
}

impl<W: Write> Listener for DeviceTableListener<W> {
    fn name(&self) -> &str {
        "device-table"
    }

    fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        let force = !matches!(event, Event::Encounter(_));
        let due = self
            .last_draw
            .map_or(true, |at| at.elapsed() >= self.min_redraw);
        if force || due {
            self.last_draw = Some(Instant::now());
            self.draw()?;
        }
        Ok(())
    }
}

// ── Link report ───────────────────────────────────────────────────────

/// Prints one line per discovered link.
pub struct LinkReportListener<W: Write> {
    out: W,
}

impl<W: Write> LinkReportListener<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// `"<time>: OLD is now NEW after gap of Nms"`.
pub fn describe_link(link: &Link) -> String {
    format!(
        "{}: {} is now {} after gap of {}ms",
        link.discovered_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        link.old,
        link.new,
        link.gap_ms()
    )
}

impl<W: Write> Listener for LinkReportListener<W> {
    fn name(&self) -> &str {
        "link-report"
    }

    fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::Linked(link) => writeln!(self.out, "{}", describe_link(link))?,
            Event::SourceClosed(reason) => writeln!(self.out, "Source closed: {reason}")?,
            Event::Encounter(_) => return Ok(()),
        }
        self.out.flush()?;
        Ok(())
    }
}

/*!

Leveled logging with a global verbosity threshold.

Messages are logged *at* a verbosity and only emitted while that verbosity
is at most the global setting; a message at verbosity 0 is always emitted.
The level (error, warning, info, …) describes what kind of message it is,
the verbosity how chatty the logger has to be before it appears.

```
use backgc::log::{set_verbosity, info, debug};

set_verbosity(2);
info!(1, "collection finished");        // emitted
debug!(3, "cursor advanced");           // suppressed
```

Under the hood every message is a `tracing` event carrying a `verbosity`
field. One `FieldScan` visitor understands that field for the whole module:
the gate layer runs it to decide whether an event is emitted at all, and
the field formatter runs it again to print the remaining fields with the
verbosity stripped. The macros initialise the logging system implicitly;
no setup call is required.

*/

use std::{
  fmt::Debug,
  sync::{
    atomic::{AtomicU8, Ordering},
    LazyLock,
  },
};

use tracing::{
  field::{Field, Visit},
  Event,
  Subscriber,
};
use tracing_subscriber::{
  field::RecordFields,
  fmt,
  fmt::{format::Writer, FormatFields},
  layer::{Context, SubscriberExt},
  registry::LookupSpan,
  Layer,
  Registry,
};

/// Name of the event field the macros attach the verbosity under.
const VERBOSITY_FIELD: &str = "verbosity";

/// Used for implicit initialization.
static INIT_LOGGER: LazyLock<()> = LazyLock::new(|| {
  let subscriber = Registry::default()
      .with(VerbosityGate)
      .with(
        fmt::layer()
            .fmt_fields(FieldPrinter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stdout),
      );

  tracing::subscriber::set_global_default(subscriber).expect("failed to set subscriber");
});

/// This does not need to be called directly. Initializes the logging system.
pub fn init_logger() {
  LazyLock::force(&INIT_LOGGER);
}

static GLOBAL_VERBOSITY: AtomicU8 = AtomicU8::new(3);

/// Sets the global verbosity. Messages logged at a higher verbosity are
/// suppressed.
pub fn set_verbosity(verbosity: u8) {
  GLOBAL_VERBOSITY.store(verbosity, Ordering::SeqCst);
}

pub fn verbosity() -> u8 {
  GLOBAL_VERBOSITY.load(Ordering::SeqCst)
}

/// The one field visitor of this module. Run with no writer it merely pulls
/// the `verbosity` field out of an event; run with a writer it additionally
/// prints every other field, so the gate layer and the field formatter stay
/// in agreement about what the verbosity field means.
struct FieldScan<'w> {
  verbosity: Option<u8>,
  writer   : Option<Writer<'w>>,
}

impl<'w> FieldScan<'w> {
  /// Extraction only, for the gate layer.
  fn probe() -> FieldScan<'w> {
    FieldScan {
      verbosity: None,
      writer   : None,
    }
  }

  /// Extraction plus printing, for the field formatter.
  fn printer(writer: Writer<'w>) -> FieldScan<'w> {
    FieldScan {
      verbosity: None,
      writer   : Some(writer),
    }
  }

  fn note_verbosity<N>(&mut self, value: N)
  where
    u8: TryFrom<N>,
    N: Copy + std::fmt::Display,
  {
    match u8::try_from(value) {
      Ok(v) => self.verbosity = Some(v),
      Err(_) => panic!("invalid verbosity supplied to the logger: {}", value),
    }
  }
}

impl Visit for FieldScan<'_> {
  fn record_i64(&mut self, field: &Field, value: i64) {
    if field.name() == VERBOSITY_FIELD {
      self.note_verbosity(value);
    } else if let Some(writer) = self.writer.as_mut() {
      let _ = write!(writer, "{}={} ", field.name(), value);
    }
  }

  fn record_u64(&mut self, field: &Field, value: u64) {
    if field.name() == VERBOSITY_FIELD {
      self.note_verbosity(value);
    } else if let Some(writer) = self.writer.as_mut() {
      let _ = write!(writer, "{}={} ", field.name(), value);
    }
  }

  fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
    if field.name() == VERBOSITY_FIELD {
      // The macros always record it numerically.
      panic!("invalid verbosity supplied to the logger: {:?}", value);
    }
    if let Some(writer) = self.writer.as_mut() {
      let _ = match field.name() {
        "message" => write!(writer, "{:?}", value),
        name => write!(writer, "{}={:?} ", name, value),
      };
    }
  }
}

/// Drops events whose verbosity exceeds the global setting.
struct VerbosityGate;

impl<S> Layer<S> for VerbosityGate
where
  S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
  fn event_enabled(&self, event: &Event<'_>, _ctx: Context<'_, S>) -> bool {
    let mut scan = FieldScan::probe();
    event.record(&mut scan);
    // An event without a verbosity counts as verbosity 0 and is emitted.
    scan.verbosity.map_or(true, |v| v <= verbosity())
  }
}

/// Prints an event's fields with the verbosity field stripped.
struct FieldPrinter;

impl<'writer> FormatFields<'writer> for FieldPrinter {
  fn format_fields<R: RecordFields>(&self, writer: Writer<'writer>, fields: R) -> std::fmt::Result {
    let mut scan = FieldScan::printer(writer);
    fields.record(&mut scan);
    Ok(())
  }
}

// Every level macro is a thin wrapper over one generator. Syntax:
//
//   level!(verbosity, "format string", args...);
//   level!("format string");                      // verbosity 0

#[doc(hidden)]
#[macro_export]
macro_rules! __log_at {
  ($level:ident, $verbosity:expr, $($arg:tt)+) => {{
    $crate::log::init_logger();
    tracing::event!(
      tracing::Level::$level,
      verbosity = $verbosity,
      message = format_args!($($arg)+)
    );
  }};
}

#[macro_export]
macro_rules! error {
  ($verbosity:expr, $($arg:tt)+) => { $crate::__log_at!(ERROR, $verbosity, $($arg)+) };
  ($($arg:tt)+) => { $crate::__log_at!(ERROR, 0, $($arg)+) };
}

#[macro_export]
macro_rules! warning {
  ($verbosity:expr, $($arg:tt)+) => { $crate::__log_at!(WARN, $verbosity, $($arg)+) };
  ($($arg:tt)+) => { $crate::__log_at!(WARN, 0, $($arg)+) };
}

#[macro_export]
macro_rules! info {
  ($verbosity:expr, $($arg:tt)+) => { $crate::__log_at!(INFO, $verbosity, $($arg)+) };
  ($($arg:tt)+) => { $crate::__log_at!(INFO, 0, $($arg)+) };
}

#[macro_export]
macro_rules! debug {
  ($verbosity:expr, $($arg:tt)+) => { $crate::__log_at!(DEBUG, $verbosity, $($arg)+) };
  ($($arg:tt)+) => { $crate::__log_at!(DEBUG, 0, $($arg)+) };
}

#[macro_export]
macro_rules! trace {
  ($verbosity:expr, $($arg:tt)+) => { $crate::__log_at!(TRACE, $verbosity, $($arg)+) };
  ($($arg:tt)+) => { $crate::__log_at!(TRACE, 0, $($arg)+) };
}

// The following makes the macros importable directly from the `log` module.
pub use {debug, error, info, trace, warning};

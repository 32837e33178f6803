use crate::coverage::{CoverageMap, Signature};
use crate::ei::{IndexCapability, NoIndex};
use crate::observer::Observer;
use crate::probe::ProbeId;
use crate::stream::{InputStream, StreamError};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::ops::RangeInclusive;
use std::panic::{self, AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Once;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The deadline is checked once every this many trace events (must be a power of two).
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

thread_local! {
    /// `file:line:column` of the last panic raised on this thread.
    static PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static LOCATION_HOOK: Once = Once::new();

/// Wraps the panic hook installed at the time of the first run so caught panics keep their
/// source location. The wrapped hook still runs afterwards. A hook set later replaces this
/// one, and panics then fall back to deduplicating on their message.
fn install_location_hook() {
    LOCATION_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                let site = format!(
                    "{}:{}:{}",
                    location.file(),
                    location.line(),
                    location.column()
                );
                PANIC_LOCATION.with(|slot| *slot.borrow_mut() = Some(site));
            }
            previous(info);
        }));
    });
}

fn take_panic_location() -> Option<String> {
    PANIC_LOCATION.with(|slot| slot.borrow_mut().take())
}

/// A failure reported by the test target, or a panic caught while running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub cause: String,
    pub location: Option<String>,
}

impl Failure {
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            location: None,
        }
    }

    pub fn at(cause: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            location: Some(location.into()),
        }
    }

    /// Hex MD5 of the location, or of the cause when no location was reported.
    pub fn dedup_key(&self) -> String {
        let basis = self.location.as_deref().unwrap_or(&self.cause);
        format!("{:x}", md5::compute(basis.as_bytes()))
    }
}

/// The generator could not decode a well-formed value from the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct Invalid(pub String);

impl From<StreamError> for Invalid {
    fn from(err: StreamError) -> Self {
        Invalid(err.to_string())
    }
}

/// Outcome of exactly one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Success,
    Failure(Failure),
    Invalid(String),
    Timeout,
}

impl RunResult {
    /// Invalid runs do not count toward trial budgets.
    pub fn counts_as_trial(&self) -> bool {
        !matches!(self, RunResult::Invalid(_))
    }
}

/// Unwind payload used to abandon a run that overran its deadline.
struct DeadlineExceeded;

/// Everything a generator and a test target can touch during one run.
///
/// Byte reads go through the input stream, probe hits into the coverage map, and both are
/// reported to the indexing capability so it can tag them with the current call context.
pub struct RunContext<'a> {
    stream: InputStream,
    coverage: &'a mut CoverageMap,
    index: &'a mut dyn IndexCapability,
    touched_config: BTreeMap<String, String>,
    deadline: Option<Instant>,
    events: u64,
}

impl<'a> RunContext<'a> {
    pub fn new(
        stream: InputStream,
        coverage: &'a mut CoverageMap,
        index: &'a mut dyn IndexCapability,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            stream,
            coverage,
            index,
            touched_config: BTreeMap::new(),
            deadline,
            events: 0,
        }
    }

    #[inline]
    fn tick(&mut self) {
        self.events += 1;
        if self.events & (DEADLINE_CHECK_INTERVAL - 1) == 0 {
            self.check_deadline();
        }
    }

    fn check_deadline(&self) {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                resume_unwind(Box::new(DeadlineExceeded));
            }
        }
    }

    pub fn byte(&mut self) -> Result<u8, StreamError> {
        self.tick();
        let before = self.stream.position();
        let byte = self.stream.next_byte()?;
        if self.stream.position() > before {
            self.index.on_read();
        }
        Ok(byte)
    }

    pub fn bool(&mut self) -> Result<bool, StreamError> {
        Ok(self.byte()? & 1 == 1)
    }

    /// Reads exactly `n` real bytes; fails even in fixed-size mode if they are not there.
    pub fn bytes(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let before = self.stream.position();
            let byte = self.byte()?;
            if self.stream.position() == before {
                return Err(StreamError::EndOfData { consumed: before });
            }
            out.push(byte);
        }
        Ok(out)
    }

    pub fn u32_le(&mut self) -> Result<u32, StreamError> {
        let raw = self.bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// A value in `0..bound`; `bound` must be non-zero.
    pub fn int_below(&mut self, bound: u32) -> Result<u32, Invalid> {
        if bound == 0 {
            return Err(Invalid("empty range".to_string()));
        }
        if bound <= 256 {
            return Ok(u32::from(self.byte()?) % bound);
        }
        Ok(self.u32_le()? % bound)
    }

    pub fn int_in(&mut self, range: RangeInclusive<u32>) -> Result<u32, Invalid> {
        let (low, high) = range.into_inner();
        if low > high {
            return Err(Invalid(format!("empty range {low}..={high}")));
        }
        match (high - low).checked_add(1) {
            Some(span) => Ok(low + self.int_below(span)?),
            None => Ok(self.u32_le()?),
        }
    }

    pub fn choose<'c, T>(&mut self, items: &'c [T]) -> Result<&'c T, Invalid> {
        let idx = self.int_below(items.len() as u32)? as usize;
        Ok(&items[idx])
    }

    #[inline]
    pub fn hit(&mut self, probe: ProbeId) {
        self.hit_raw(probe.raw());
    }

    /// Probe callback for raw ids coming straight from instrumentation.
    #[inline]
    pub fn hit_raw(&mut self, raw: u32) {
        self.tick();
        self.coverage.record_raw(raw);
        self.index.on_probe(raw);
    }

    pub fn enter(&mut self, call_site: u32) {
        self.tick();
        self.index.enter(call_site);
    }

    pub fn exit(&mut self) {
        self.index.exit();
    }

    /// Records that the target read configuration key `key` with value `value`.
    pub fn track_config(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.touched_config.insert(key.into(), value.into());
    }

    pub fn is_fresh(&self) -> bool {
        self.stream.is_fresh()
    }

    pub fn remaining(&self) -> Option<usize> {
        self.stream.remaining()
    }

    pub fn position(&self) -> usize {
        self.stream.position()
    }
}

/// What the guidance learns from one run besides the coverage map contents.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: RunResult,
    /// Bytes actually consumed by the generator.
    pub consumed: Vec<u8>,
    /// Deterministic cost: bytes read, probes hit, and calls entered.
    pub cost: u64,
    pub elapsed: Duration,
    pub touched_config: BTreeMap<String, String>,
}

pub trait Executor {
    /// Runs the harness once on `stream`, resetting `coverage` and `index` first.
    fn execute(
        &mut self,
        stream: InputStream,
        coverage: &mut CoverageMap,
        index: &mut dyn IndexCapability,
    ) -> RunReport;
}

/// Runs a structured generator and a test target in the current thread.
///
/// Panics from either are caught and reported as failures. A run that overruns its timeout
/// is abandoned at the next trace event and reported as [`RunResult::Timeout`].
pub struct InProcessExecutor<G, T, V> {
    generator: G,
    target: T,
    timeout: Option<Duration>,
    _value: PhantomData<fn() -> V>,
}

impl<G, T, V> InProcessExecutor<G, T, V>
where
    G: Fn(&mut RunContext<'_>) -> Result<V, Invalid>,
    T: Fn(&V, &mut RunContext<'_>) -> Result<(), Failure>,
{
    pub fn new(generator: G, target: T) -> Self {
        Self {
            generator,
            target,
            timeout: None,
            _value: PhantomData,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }
}

impl<G, T, V> Executor for InProcessExecutor<G, T, V>
where
    G: Fn(&mut RunContext<'_>) -> Result<V, Invalid>,
    T: Fn(&V, &mut RunContext<'_>) -> Result<(), Failure>,
{
    fn execute(
        &mut self,
        stream: InputStream,
        coverage: &mut CoverageMap,
        index: &mut dyn IndexCapability,
    ) -> RunReport {
        install_location_hook();
        take_panic_location();
        coverage.pre_exec();
        index.pre_exec();

        let started = Instant::now();
        let deadline = self.timeout.map(|timeout| started + timeout);
        let mut ctx = RunContext::new(stream, coverage, index, deadline);

        let generator = &self.generator;
        let target = &self.target;
        let outcome = catch_unwind(AssertUnwindSafe(|| match generator(&mut ctx) {
            Err(invalid) => RunResult::Invalid(invalid.0),
            Ok(value) => match target(&value, &mut ctx) {
                Ok(()) => RunResult::Success,
                Err(failure) => RunResult::Failure(failure),
            },
        }));

        let result = match outcome {
            Ok(result) => result,
            Err(payload) if payload.is::<DeadlineExceeded>() => RunResult::Timeout,
            Err(payload) => RunResult::Failure(Failure {
                cause: panic_message(payload.as_ref()),
                location: take_panic_location(),
            }),
        };

        let RunContext {
            stream,
            touched_config,
            events,
            ..
        } = ctx;

        coverage.post_exec(&result);
        index.post_exec(&result);

        RunReport {
            result,
            consumed: stream.into_consumed(),
            cost: events,
            elapsed: started.elapsed(),
            touched_config,
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// Runs one saved buffer and returns its result together with the signature it produced.
pub fn replay<E: Executor + ?Sized>(
    executor: &mut E,
    bytes: Vec<u8>,
    fixed_size: bool,
) -> (RunResult, Signature) {
    let mut coverage = CoverageMap::new();
    let mut index = NoIndex;
    let report = executor.execute(
        InputStream::from_buffer(bytes, fixed_size),
        &mut coverage,
        &mut index,
    );
    (report.result, coverage.snapshot())
}

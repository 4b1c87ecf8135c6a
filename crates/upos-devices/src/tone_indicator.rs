//! Tone indicator.
//!
//! A sound cycle plays tone 1, waits `InterToneWait`, plays tone 2 and then
//! waits the call's inter-sound wait. A tone with pitch or duration zero is
//! skipped. `sound` runs asynchronously while `AsyncMode` is set and may
//! then repeat forever until the output is cleared.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;
use upos_core::constants::FOREVER;
use upos_core::{DeviceError, ExclusiveUse, PowerReporting, Result};
use upos_runtime::schema::{
    CategorySchema, CategorySchemaBuilder, Dispatch, OperationSpec, ParamSpec, Precondition,
    PropertySpec,
};
use upos_runtime::{
    Capabilities, DeviceBlueprint, DeviceDriver, DeviceRegistry, EventListener,
    EventSink, Params, PropertyBag, PropertyState, RequestContext, RequestHandle, Service,
};

use crate::sim::{SimCore, lock};

pub const CATEGORY: &str = "ToneIndicator";

/// Fired when the last queued sound finished and `FlagWhenIdle` is set.
pub const STATUS_IDLE: i32 = 1001;

/// One of the two tones of a sound cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneNumber {
    One,
    Two,
}

impl ToneNumber {
    fn names(self) -> [&'static str; 3] {
        match self {
            Self::One => ["Tone1Pitch", "Tone1Duration", "Tone1Volume"],
            Self::Two => ["Tone2Pitch", "Tone2Duration", "Tone2Volume"],
        }
    }
}

/// Pitch in Hz, duration in milliseconds, volume in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tone {
    pub pitch: i64,
    pub duration: i64,
    pub volume: i64,
}

impl Tone {
    fn audible(&self) -> bool {
        self.pitch > 0 && self.duration > 0
    }

    fn read(state: &PropertyState, number: ToneNumber) -> Self {
        let [pitch, duration, volume] = number.names();
        Self {
            pitch: state.int(pitch).unwrap_or(0),
            duration: state.int(duration).unwrap_or(0),
            volume: state.int(volume).unwrap_or(0),
        }
    }
}

fn tone_properties(builder: CategorySchemaBuilder, number: ToneNumber) -> CategorySchemaBuilder {
    let [pitch, duration, volume] = number.names();
    builder
        .property(
            PropertySpec::read_write(pitch, 0)
                .readable_after_enable()
                .range(0, i64::MAX),
        )
        .property(
            PropertySpec::read_write(duration, 0)
                .readable_after_enable()
                .range(0, i64::MAX),
        )
        .property(
            PropertySpec::read_write(volume, 100)
                .readable_after_enable()
                .range(0, 100),
        )
}

fn build(concurrent: bool) -> Result<CategorySchema> {
    let builder = CategorySchema::builder(CATEGORY)
        .exclusive_use(ExclusiveUse::Allowed)
        .property(PropertySpec::read_only("CapPitch", true))
        .property(PropertySpec::read_only("CapVolume", true))
        .property(PropertySpec::read_only("CapMelody", 0))
        .property(
            PropertySpec::read_write("InterToneWait", 0)
                .readable_after_enable()
                .range(0, i64::MAX),
        )
        .property(
            PropertySpec::read_write("MelodyType", 0)
                .readable_after_enable()
                .validate(|value, state| {
                    let max = state.int("CapMelody").unwrap_or(0);
                    match value.as_int() {
                        Some(v) if (0..=max).contains(&v) => Ok(()),
                        _ => Err(DeviceError::illegal_argument(format!(
                            "Melody type out of range: {value}"
                        ))),
                    }
                }),
        )
        .property(
            PropertySpec::read_write("MelodyVolume", 100)
                .readable_after_enable()
                .range(0, 100),
        );
    tone_properties(tone_properties(builder, ToneNumber::One), ToneNumber::Two)
        .operation(
            OperationSpec::output("sound")
                .dispatch(Dispatch::AsyncCapable)
                .requires(Precondition::EnabledUnclaimed)
                .concurrent(concurrent)
                .param(ParamSpec::int("numberOfCycles"))
                .param(ParamSpec::int("interSoundWait").range(0, i64::MAX))
                .check(|params, state| {
                    let cycles = params.int("numberOfCycles").unwrap_or(0);
                    if cycles == FOREVER && !state.async_mode() {
                        return Err(DeviceError::illegal_argument(
                            "Endless sound requires AsyncMode",
                        ));
                    }
                    if cycles <= 0 && cycles != FOREVER {
                        return Err(DeviceError::illegal_argument(format!(
                            "Invalid numberOfCycles: {cycles}"
                        )));
                    }
                    Ok(())
                }),
        )
        .operation(
            OperationSpec::output("soundImmediate").requires(Precondition::EnabledUnclaimed),
        )
        .idle_status(STATUS_IDLE)
        .build()
}

/// Category description. Asynchronous sounds run one after the other.
pub fn schema() -> Result<CategorySchema> {
    build(false)
}

/// Category description for hardware that mixes sounds: asynchronous
/// sounds run next to each other.
pub fn concurrent_schema() -> Result<CategorySchema> {
    build(true)
}

/// One completed or aborted sound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Played {
    pub output_id: i32,
    pub tones: [Tone; 2],
    /// Cycles played to the end.
    pub cycles: u64,
    pub aborted: bool,
}

#[derive(Debug, Default)]
struct Shared {
    core: SimCore,
    played: Mutex<Vec<Played>>,
}

/// Simulated tone indicator. Tones are timed but silent.
#[derive(Debug)]
pub struct SimToneIndicator {
    shared: Arc<Shared>,
}

/// Cycles still to play once `played` are done. Unbounded for `FOREVER`.
fn cycles_left(cycles: i64, played: u64) -> u64 {
    if cycles == FOREVER {
        return u64::MAX;
    }
    u64::try_from(cycles).unwrap_or(0).saturating_sub(played)
}

impl SimToneIndicator {
    pub fn new() -> (Self, SimToneIndicatorHandle) {
        let shared = Arc::new(Shared::default());
        let handle = SimToneIndicatorHandle {
            shared: shared.clone(),
        };
        (Self { shared }, handle)
    }

    async fn play(&self, ctx: &RequestContext, cycles: i64, inter_sound_wait: i64) -> Result<()> {
        let (tones, inter_tone_wait) = ctx.property_set().snapshot(|state| {
            (
                [Tone::read(state, ToneNumber::One), Tone::read(state, ToneNumber::Two)],
                state.int("InterToneWait").unwrap_or(0),
            )
        });
        let millis = |value: i64| Duration::from_millis(u64::try_from(value).unwrap_or(0));

        let mut played = 0u64;
        let mut aborted = false;
        'cycles: while cycles_left(cycles, played) > 0 {
            let [first, second] = &tones;
            let mut steps = Vec::with_capacity(4);
            if first.audible() {
                steps.push(millis(first.duration));
            }
            if first.audible() && second.audible() {
                steps.push(millis(inter_tone_wait));
            }
            if second.audible() {
                steps.push(millis(second.duration));
            }
            if cycles_left(cycles, played) > 1 {
                steps.push(millis(inter_sound_wait));
            }
            if cycles == FOREVER && steps.iter().all(Duration::is_zero) {
                steps.push(Duration::from_millis(1));
            }
            for step in steps {
                if !ctx.sleep(step).await {
                    aborted = true;
                    break 'cycles;
                }
            }
            played = played.saturating_add(1);
        }

        debug!(
            "{}: played {} cycle(s) of {:?}",
            ctx.property_set().logical_name(),
            played,
            tones
        );
        lock(&self.shared.played).push(Played {
            output_id: ctx.output_id(),
            tones,
            cycles: played,
            aborted,
        });
        if aborted {
            return Err(DeviceError::aborted(ctx.operation()));
        }
        self.shared.core.take_failure()
    }
}

impl DeviceDriver for SimToneIndicator {
    fn attach(&self, sink: EventSink) {
        self.shared.core.attach(sink);
    }

    fn open(&self, state: &mut PropertyState) -> Result<()> {
        state.set_capabilities(Capabilities {
            power_reporting: PowerReporting::Standard,
            ..Capabilities::default()
        });
        Ok(())
    }

    fn execute<'a>(&'a self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match ctx.operation() {
                "sound" => {
                    let cycles = ctx.params().int("numberOfCycles").unwrap_or(1);
                    let wait = ctx.params().int("interSoundWait").unwrap_or(0);
                    self.play(ctx, cycles, wait).await
                }
                "soundImmediate" => self.play(ctx, 1, 0).await,
                other => Err(DeviceError::unsupported(other)),
            }
        })
    }
}

/// Observer of a simulated tone indicator.
#[derive(Debug, Clone)]
pub struct SimToneIndicatorHandle {
    shared: Arc<Shared>,
}

impl SimToneIndicatorHandle {
    /// Sound requests in the order they finished.
    pub fn played(&self) -> Vec<Played> {
        lock(&self.shared.played).clone()
    }

    /// Make the next sound fail with `error` after it played.
    pub fn fail_next(&self, error: DeviceError) {
        self.shared.core.fail_next(error);
    }
}

/// Blueprint plus observer for a configured simulated tone indicator.
///
/// `concurrent = true` lets asynchronous sounds overlap.
///
/// # Errors
///
/// Fails for malformed configuration values.
pub fn simulate(bag: &PropertyBag) -> Result<(DeviceBlueprint, SimToneIndicatorHandle)> {
    let schema = match bag.bool_or("concurrent", false)? {
        true => concurrent_schema()?,
        false => schema()?,
    };
    let (driver, handle) = SimToneIndicator::new();
    Ok((DeviceBlueprint::new(schema, driver), handle))
}

/// Typed view of a tone indicator service.
#[derive(Debug)]
pub struct ToneIndicator {
    service: Service,
}

impl ToneIndicator {
    /// Open a handle on `physical_id`, creating the device from `driver` if
    /// it is not open yet.
    ///
    /// # Errors
    ///
    /// Fails if the device cannot be opened.
    pub fn open(
        registry: &DeviceRegistry,
        logical_name: &str,
        physical_id: &str,
        driver: impl DeviceDriver,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self> {
        let service = Service::open(
            registry,
            logical_name,
            physical_id,
            || Ok(DeviceBlueprint::new(schema()?, driver)),
            listener,
        )?;
        Ok(Self::from_service(service))
    }

    pub fn from_service(service: Service) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn into_service(self) -> Service {
        self.service
    }

    pub fn tone(&self, number: ToneNumber) -> Result<Tone> {
        let [pitch, duration, volume] = number.names();
        Ok(Tone {
            pitch: self.service.get_int(pitch)?,
            duration: self.service.get_int(duration)?,
            volume: self.service.get_int(volume)?,
        })
    }

    /// Set pitch, duration and volume of one tone. Stops at the first value
    /// that is rejected.
    pub fn set_tone(&self, number: ToneNumber, tone: Tone) -> Result<()> {
        let [pitch, duration, volume] = number.names();
        self.service.set(pitch, tone.pitch)?;
        self.service.set(duration, tone.duration)?;
        self.service.set(volume, tone.volume)
    }

    pub fn inter_tone_wait(&self) -> Result<i64> {
        self.service.get_int("InterToneWait")
    }

    pub fn set_inter_tone_wait(&self, millis: i64) -> Result<()> {
        self.service.set("InterToneWait", millis)
    }

    /// Play `cycles` sound cycles, [`FOREVER`] for an endless sound in
    /// asynchronous mode.
    ///
    /// Returns the request handle when the sound was queued.
    pub async fn sound(
        &self,
        cycles: i64,
        inter_sound_wait: i64,
    ) -> Result<Option<RequestHandle>> {
        let params = Params::new()
            .with("numberOfCycles", cycles)
            .with("interSoundWait", inter_sound_wait);
        self.service.invoke("sound", params).await
    }

    /// Drop queued sounds and play one cycle now.
    pub async fn sound_immediate(&self) -> Result<()> {
        self.service.clear_output().await?;
        self.service.invoke("soundImmediate", Params::new()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_schema() {
        assert!(!schema().unwrap().operation("sound").unwrap().is_concurrent());
        assert!(concurrent_schema().unwrap().operation("sound").unwrap().is_concurrent());
        assert_eq!(schema().unwrap().idle_status(), Some(STATUS_IDLE));
    }

    #[test]
    fn test_cycles_left() {
        assert_eq!(cycles_left(2, 0), 2);
        assert_eq!(cycles_left(2, 2), 0);
        assert_eq!(cycles_left(-3, 0), 0);
        let past_u32 = u64::from(u32::MAX) + 1;
        assert_eq!(cycles_left(i64::MAX, past_u32), u64::try_from(i64::MAX).unwrap() - past_u32);
        assert_eq!(cycles_left(FOREVER, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_tone_audible() {
        let tone = Tone {
            pitch: 440,
            duration: 0,
            volume: 100,
        };
        assert!(!tone.audible());
        assert!(Tone { duration: 100, ..tone }.audible());
    }
}

//! Built-in harnesses, selected with `--harness` or `harness.harness-key`.

use anyhow::anyhow;
use gyre_core::executor::{Executor, Failure, InProcessExecutor, Invalid, RunContext};
use gyre_core::probe::ProbeId;
use std::time::Duration;

pub const HARNESS_KEYS: &[&str] = &["magic-int", "bad-prefix", "config-keys"];

/// Probe component shared by the built-in harnesses; each harness gets its own unit.
const HARNESS_COMPONENT: u32 = 2;

const MAGIC: u32 = 42;

const COMPRESSIONS: [&str; 3] = ["none", "gzip", "zstd"];

pub fn executor(key: &str, timeout: Option<Duration>) -> anyhow::Result<Box<dyn Executor>> {
    match key {
        "magic-int" => magic_int(timeout),
        "bad-prefix" => bad_prefix(timeout),
        "config-keys" => config_keys(timeout),
        other => Err(anyhow!(
            "Unknown harness {other:?}, expected one of: {}",
            HARNESS_KEYS.join(", ")
        )),
    }
}

/// Decodes a little-endian u32 and fails on the magic value. Each matching low byte has its
/// own probe so the comparison can be solved one byte at a time.
fn magic_int(timeout: Option<Duration>) -> anyhow::Result<Box<dyn Executor>> {
    let base = ProbeId::pack(HARNESS_COMPONENT, 1, 0)?.raw();
    let generator = |ctx: &mut RunContext<'_>| -> Result<u32, Invalid> { Ok(ctx.u32_le()?) };
    let target = move |value: &u32, ctx: &mut RunContext<'_>| -> Result<(), Failure> {
        ctx.hit_raw(base);
        let matched = value
            .to_le_bytes()
            .iter()
            .zip(MAGIC.to_le_bytes())
            .take_while(|(got, want)| **got == *want)
            .count();
        for len in 1..=matched {
            ctx.hit_raw(base + len as u32);
        }
        if *value == MAGIC {
            return Err(Failure::at(
                format!("decoded the magic value {MAGIC}"),
                "magic-int:compare",
            ));
        }
        Ok(())
    };
    Ok(Box::new(
        InProcessExecutor::new(generator, target).with_timeout(timeout),
    ))
}

/// A short byte string; the target panics on a `BAD` or `CRAS` prefix.
fn bad_prefix(timeout: Option<Duration>) -> anyhow::Result<Box<dyn Executor>> {
    let base = ProbeId::pack(HARNESS_COMPONENT, 2, 0)?.raw();
    let generator = |ctx: &mut RunContext<'_>| -> Result<Vec<u8>, Invalid> {
        let len = ctx.int_in(0..=8)? as usize;
        Ok(ctx.bytes(len)?)
    };
    let target = move |data: &Vec<u8>, ctx: &mut RunContext<'_>| -> Result<(), Failure> {
        ctx.hit_raw(base);
        for (i, word) in [b"BAD".as_slice(), b"CRAS".as_slice()].iter().enumerate() {
            let matched = data
                .iter()
                .zip(word.iter())
                .take_while(|(a, b)| a == b)
                .count();
            for len in 1..=matched {
                ctx.hit_raw(base + (i as u32) * 16 + len as u32);
            }
        }
        if data.starts_with(b"BAD") {
            panic!("BAD input detected by harness!");
        }
        if data.starts_with(b"CRAS") {
            panic!("CRASH input detected by harness!");
        }
        Ok(())
    };
    Ok(Box::new(
        InProcessExecutor::new(generator, target).with_timeout(timeout),
    ))
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    compression: &'static str,
    level: u32,
    checksum: bool,
}

/// Decodes a small settings record and reports every key it reads, for the pre-round.
fn config_keys(timeout: Option<Duration>) -> anyhow::Result<Box<dyn Executor>> {
    let base = ProbeId::pack(HARNESS_COMPONENT, 3, 0)?.raw();
    let generator = |ctx: &mut RunContext<'_>| -> Result<Settings, Invalid> {
        ctx.enter(1);
        let compression = *ctx.choose(&COMPRESSIONS)?;
        ctx.exit();
        ctx.enter(2);
        let level = ctx.int_in(0..=22)?;
        ctx.exit();
        ctx.enter(3);
        let checksum = ctx.bool()?;
        ctx.exit();
        Ok(Settings {
            compression,
            level,
            checksum,
        })
    };
    let target = move |settings: &Settings, ctx: &mut RunContext<'_>| -> Result<(), Failure> {
        ctx.track_config("compression", settings.compression);
        ctx.track_config("level", settings.level.to_string());
        ctx.track_config("checksum", settings.checksum.to_string());

        let algorithm = COMPRESSIONS
            .iter()
            .position(|c| *c == settings.compression)
            .unwrap_or(0) as u32;
        ctx.hit_raw(base + algorithm);
        if settings.compression == "none" {
            return Ok(());
        }
        // One probe per band of five levels, per algorithm.
        ctx.hit_raw(base + 8 + algorithm * 8 + settings.level / 5);
        if !settings.checksum {
            ctx.hit_raw(base + 64 + algorithm);
            if settings.compression == "zstd" && settings.level > 19 {
                return Err(Failure::at(
                    "zstd above level 19 requires a checksum",
                    "config-keys:validate",
                ));
            }
        }
        Ok(())
    };
    Ok(Box::new(
        InProcessExecutor::new(generator, target).with_timeout(timeout),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_core::executor::{RunResult, replay};

    #[test]
    fn every_listed_key_builds_an_executor() {
        for key in HARNESS_KEYS {
            assert!(executor(key, None).is_ok(), "{key}");
        }
        assert!(executor("nope", None).is_err());
    }

    #[test]
    fn magic_int_fails_only_on_the_magic_value() {
        let mut exec = executor("magic-int", None).unwrap();
        let (hit, _) = replay(exec.as_mut(), 42u32.to_le_bytes().to_vec(), true);
        assert!(matches!(hit, RunResult::Failure(_)));
        let (miss, signature) = replay(exec.as_mut(), 42u32.to_le_bytes()[..2].to_vec(), true);
        assert!(matches!(miss, RunResult::Invalid(_)));
        assert!(signature.is_empty());
        let (close, signature) = replay(exec.as_mut(), vec![42, 0, 0, 1], true);
        assert_eq!(close, RunResult::Success);
        assert_eq!(signature.len(), 4);
    }

    #[test]
    fn bad_prefix_panics_become_failures() {
        let mut exec = executor("bad-prefix", None).unwrap();
        let (result, _) = replay(exec.as_mut(), b"\x03BAD".to_vec(), false);
        match result {
            RunResult::Failure(failure) => assert!(failure.cause.contains("BAD")),
            other => panic!("Expected a failure, got {other:?}"),
        }
        let (result, _) = replay(exec.as_mut(), b"\x02OK".to_vec(), false);
        assert_eq!(result, RunResult::Success);
    }

    #[test]
    fn config_keys_reports_its_settings() {
        let mut exec = executor("config-keys", None).unwrap();
        // zstd, level 22, no checksum
        let (result, _) = replay(exec.as_mut(), vec![2, 22, 0], false);
        assert!(matches!(result, RunResult::Failure(_)));
        let (result, _) = replay(exec.as_mut(), vec![2, 22, 1], false);
        assert_eq!(result, RunResult::Success);
    }
}

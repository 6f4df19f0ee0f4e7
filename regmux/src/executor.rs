//! Register-program executor.
//!
//! Runs an ordered list of io-entries against one device's register
//! capability: write-barrier at entry, read-barrier at exit, the shared-bus
//! mutex held across the whole run, first error stops the program (partial
//! side effects remain), and a cancellation token is honored between entries.

use crate::device::{Device, RegisterIo};
use crate::error::{Error, Result, CANCELLATION_CODE};
use crate::io_entry::{IoEntry, TransactionResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Executes a program against `device`, mirroring results into `resp`.
///
/// With `skip_err` set (device-reset cleanup programs), failing entries are
/// logged and skipped instead of stopping the run; the last error code is
/// still recorded in the response.
pub async fn run_program(
    device: &Device,
    entries: &[IoEntry],
    resp: &mut TransactionResponse,
    cancel: Option<&CancellationToken>,
    skip_err: bool,
) -> Result<()> {
    if device.is_suspended() {
        resp.error_code = Error::Busy.code();
        return Err(Error::Busy);
    }
    let reg_io = match device.register_io() {
        Ok(io) => Arc::clone(io),
        Err(e) => {
            resp.error_code = e.code();
            return Err(e);
        }
    };
    let bitwidth = device.native_value_bitwidth();
    let poll_interval = device.poll_interval();

    reg_io.barrier(false, true);

    // The bus mutex spans a single program run; devices sharing the bus
    // cannot interleave register accesses.
    let bus = device.bus_manager();
    let _bus_guard = match bus.as_ref() {
        Some(manager) => Some(manager.lock_bus().await),
        None => None,
    };

    let mut first_err = None;
    for (index, entry) in entries.iter().enumerate() {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                resp.error_code = CANCELLATION_CODE;
                first_err = Some(Error::Canceled);
                break;
            }
        }
        match run_entry(reg_io.as_ref(), bitwidth, poll_interval, entry, resp).await {
            Ok(()) => resp.completion_index = index as i32,
            Err(e) => {
                resp.error_code = e.completion_code();
                if skip_err {
                    warn!(
                        device = %device.name(),
                        index,
                        error = %e,
                        "io entry failed, skipping and running the next entry"
                    );
                    continue;
                }
                first_err = Some(e);
                break;
            }
        }
    }

    drop(_bus_guard);
    reg_io.barrier(true, false);

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_entry(
    io: &dyn RegisterIo,
    bitwidth: u32,
    poll_interval: Duration,
    entry: &IoEntry,
    resp: &mut TransactionResponse,
) -> Result<()> {
    match entry {
        IoEntry::Read { offset } => {
            let value = io.read(*offset, bitwidth).await?;
            resp.push_value(*offset, value, bitwidth);
        }
        IoEntry::Write { offset, value } => {
            io.write(*offset, *value, bitwidth).await?;
        }
        IoEntry::Modify {
            offset,
            mask,
            value,
        } => {
            let current = io.read(*offset, bitwidth).await?;
            let merged = (current & !mask) | (value & mask);
            io.write(*offset, merged, bitwidth).await?;
        }
        IoEntry::ReadBatch { offset, size } => {
            let mut buf = vec![0u8; *size];
            io.read_batch(*offset, &mut buf).await?;
            resp.push_bytes(*offset, buf);
        }
        IoEntry::WriteBatch { offset, bytes } => {
            io.write_batch(*offset, bytes).await?;
        }
        IoEntry::Poll {
            offset,
            mask,
            value,
            timeout_ms,
        } => {
            let deadline = tokio::time::Instant::now() + Duration::from_millis(*timeout_ms);
            loop {
                let current = io.read(*offset, bitwidth).await?;
                if (current & mask) == (value & mask) {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
                tokio::time::sleep(poll_interval).await;
            }
        }
        IoEntry::ReadAssert {
            offset,
            mask,
            expected,
        } => {
            let current = io.read(*offset, bitwidth).await?;
            if (current & mask) != (expected & mask) {
                return Err(Error::InvalidState(format!(
                    "register {offset:#x}: read {current:#x}, expected {expected:#x} under mask {mask:#x}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, DeviceKind, NullDeviceOps, TestRegisterIo};
    use crate::time::MonotonicClock;

    fn device_with(io: Arc<TestRegisterIo>) -> Arc<Device> {
        Device::new(
            DeviceConfig::new(1, "exec-test", DeviceKind::Test),
            Some(io),
            Arc::new(NullDeviceOps),
            MonotonicClock::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let io = Arc::new(TestRegisterIo::new());
        let device = device_with(Arc::clone(&io));
        let entries = vec![
            IoEntry::Write {
                offset: 0x100,
                value: 0xDEAD,
            },
            IoEntry::Read { offset: 0x100 },
        ];
        let mut resp = TransactionResponse::new(0);
        run_program(&device, &entries, &mut resp, None, false)
            .await
            .unwrap();
        assert_eq!(resp.error_code, 0);
        assert_eq!(resp.completion_index, 1);
        assert_eq!(resp.value_at(0), Some(0xDEAD));
    }

    #[tokio::test]
    async fn modify_preserves_unmasked_bits() {
        let io = Arc::new(TestRegisterIo::new());
        io.poke(0x20, 0xFFFF_0000, 32);
        let device = device_with(Arc::clone(&io));
        let entries = vec![
            IoEntry::Modify {
                offset: 0x20,
                mask: 0x0000_00FF,
                value: 0x0000_00AB,
            },
            IoEntry::Read { offset: 0x20 },
        ];
        let mut resp = TransactionResponse::new(0);
        run_program(&device, &entries, &mut resp, None, false)
            .await
            .unwrap();
        let value = resp.value_at(0).unwrap();
        assert_eq!(value & 0xFF, 0xAB);
        assert_eq!(value & 0xFFFF_0000, 0xFFFF_0000);
    }

    #[tokio::test]
    async fn poll_times_out_on_unmet_condition() {
        let io = Arc::new(TestRegisterIo::new());
        let device = device_with(Arc::clone(&io));
        let entries = vec![IoEntry::Poll {
            offset: 0x30,
            mask: 0x1,
            value: 0x1,
            timeout_ms: 5,
        }];
        let mut resp = TransactionResponse::new(0);
        let err = run_program(&device, &entries, &mut resp, None, false)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert_eq!(resp.error_code, Error::Timeout.code());
        assert_eq!(resp.completion_index, -1);
    }

    #[tokio::test]
    async fn poll_succeeds_when_bit_flips() {
        let io = Arc::new(TestRegisterIo::new());
        let device = device_with(Arc::clone(&io));
        let flipper = Arc::clone(&io);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            flipper.poke(0x30, 0x1, 32);
        });
        let entries = vec![IoEntry::Poll {
            offset: 0x30,
            mask: 0x1,
            value: 0x1,
            timeout_ms: 500,
        }];
        let mut resp = TransactionResponse::new(0);
        run_program(&device, &entries, &mut resp, None, false)
            .await
            .unwrap();
        handle.await.unwrap();
        assert_eq!(resp.error_code, 0);
    }

    #[tokio::test]
    async fn read_assert_reports_invalid_state() {
        let io = Arc::new(TestRegisterIo::new());
        io.poke(0x40, 0x2, 32);
        let device = device_with(Arc::clone(&io));
        let entries = vec![IoEntry::ReadAssert {
            offset: 0x40,
            mask: 0xF,
            expected: 0x4,
        }];
        let mut resp = TransactionResponse::new(0);
        let err = run_program(&device, &entries, &mut resp, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn first_error_stops_the_program() {
        let io = Arc::new(TestRegisterIo::new());
        let device = device_with(Arc::clone(&io));
        let entries = vec![
            IoEntry::Write {
                offset: 0x0,
                value: 1,
            },
            IoEntry::ReadAssert {
                offset: 0x0,
                mask: 0xFF,
                expected: 0x7,
            },
            IoEntry::Write {
                offset: 0x8,
                value: 2,
            },
        ];
        let mut resp = TransactionResponse::new(0);
        assert!(run_program(&device, &entries, &mut resp, None, false)
            .await
            .is_err());
        // Partial side effects remain; the entry after the failure never ran.
        assert_eq!(io.peek(0x0, 32), 1);
        assert_eq!(io.peek(0x8, 32), 0);
        assert_eq!(resp.completion_index, 0);
    }

    #[tokio::test]
    async fn skip_err_keeps_running() {
        let io = Arc::new(TestRegisterIo::new());
        let device = device_with(Arc::clone(&io));
        let entries = vec![
            IoEntry::ReadAssert {
                offset: 0x0,
                mask: 0xFF,
                expected: 0x7,
            },
            IoEntry::Write {
                offset: 0x8,
                value: 2,
            },
        ];
        let mut resp = TransactionResponse::new(0);
        run_program(&device, &entries, &mut resp, None, true)
            .await
            .unwrap();
        assert_eq!(io.peek(0x8, 32), 2);
        assert_ne!(resp.error_code, 0);
    }

    #[tokio::test]
    async fn cancellation_stops_between_entries() {
        let io = Arc::new(TestRegisterIo::new());
        let device = device_with(Arc::clone(&io));
        let token = CancellationToken::new();
        token.cancel();
        let entries = vec![IoEntry::Write {
            offset: 0x0,
            value: 1,
        }];
        let mut resp = TransactionResponse::new(0);
        let err = run_program(&device, &entries, &mut resp, Some(&token), false)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Canceled);
        assert_eq!(resp.error_code, CANCELLATION_CODE);
        assert_eq!(io.peek(0x0, 32), 0);
    }

    #[tokio::test]
    async fn virtual_device_is_rejected() {
        let device = Device::new(
            DeviceConfig::new(9, "top0", DeviceKind::Top),
            None,
            Arc::new(NullDeviceOps),
            MonotonicClock::new(),
        )
        .unwrap();
        let mut resp = TransactionResponse::new(0);
        let err = run_program(&device, &[], &mut resp, None, false)
            .await
            .unwrap_err();
        assert_eq!(err, Error::NotSupported);
    }
}

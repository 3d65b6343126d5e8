//! Recording input device.
//!
//! Backs the `dry_run` actuator backend and doubles as a scriptable device
//! for tests: failures can be injected per target address.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{DeviceError, DeviceResult, InputDevice, Modifier};
use crate::registry::Address;

/// One primitive operation observed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    Focus(Address),
    Clear(Modifier),
    Paste(String),
    Type(String),
    /// Successful submit at the focused address.
    Submit(Address),
    /// Submit that was made to fail.
    FailedSubmit(Address),
}

#[derive(Debug, Clone, Copy)]
struct FailurePlan {
    /// `None` fails forever.
    remaining: Option<u32>,
    fatal: bool,
}

#[derive(Debug, Default)]
struct DeviceState {
    actions: Vec<DeviceAction>,
    focused: Option<Address>,
    failures: HashMap<Address, FailurePlan>,
    latency: Duration,
}

/// In-memory device that records every action.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    state: Mutex<DeviceState>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` submits at `address` with a transient fault.
    pub fn fail_times(&self, address: Address, times: u32) {
        self.with_state(|s| {
            s.failures.insert(
                address,
                FailurePlan {
                    remaining: Some(times),
                    fatal: false,
                },
            );
        });
    }

    /// Fail every submit at `address` with a transient fault.
    pub fn fail_always(&self, address: Address) {
        self.with_state(|s| {
            s.failures.insert(
                address,
                FailurePlan {
                    remaining: None,
                    fatal: false,
                },
            );
        });
    }

    /// Fail every submit at `address` with a fatal fault.
    pub fn fail_fatally(&self, address: Address) {
        self.with_state(|s| {
            s.failures.insert(
                address,
                FailurePlan {
                    remaining: None,
                    fatal: true,
                },
            );
        });
    }

    /// Delay every operation, e.g. to trip the attempt timeout.
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = latency);
    }

    pub fn actions(&self) -> Vec<DeviceAction> {
        self.with_state(|s| s.actions.clone())
    }

    /// Attempts started at `address` (focus clicks).
    pub fn attempts_at(&self, address: Address) -> usize {
        self.count(|a| *a == DeviceAction::Focus(address))
    }

    /// Successful submits at `address`.
    pub fn delivered_to(&self, address: Address) -> usize {
        self.count(|a| *a == DeviceAction::Submit(address))
    }

    /// Addresses in order of successful submission.
    pub fn delivery_order(&self) -> Vec<Address> {
        self.with_state(|s| {
            s.actions
                .iter()
                .filter_map(|a| match a {
                    DeviceAction::Submit(addr) => Some(*addr),
                    _ => None,
                })
                .collect()
        })
    }

    fn count(&self, pred: impl Fn(&DeviceAction) -> bool) -> usize {
        self.with_state(|s| s.actions.iter().filter(|a| pred(a)).count())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DeviceState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    async fn pause(&self) {
        let latency = self.with_state(|s| s.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl InputDevice for RecordingDevice {
    async fn focus(&self, address: Address) -> DeviceResult<()> {
        self.with_state(|s| {
            s.focused = Some(address);
            s.actions.push(DeviceAction::Focus(address));
        });
        self.pause().await;
        Ok(())
    }

    async fn clear(&self, modifier: Modifier) -> DeviceResult<()> {
        self.with_state(|s| s.actions.push(DeviceAction::Clear(modifier)));
        Ok(())
    }

    async fn paste(&self, text: &str, _modifier: Modifier) -> DeviceResult<()> {
        self.with_state(|s| s.actions.push(DeviceAction::Paste(text.to_string())));
        Ok(())
    }

    async fn type_text(&self, text: &str) -> DeviceResult<()> {
        self.with_state(|s| s.actions.push(DeviceAction::Type(text.to_string())));
        Ok(())
    }

    async fn submit(&self) -> DeviceResult<()> {
        self.with_state(|s| {
            let address = s
                .focused
                .ok_or_else(|| DeviceError::Transient("submit without focus".to_string()))?;

            let verdict = match s.failures.get_mut(&address) {
                Some(plan) => match plan.remaining {
                    Some(0) => None,
                    Some(ref mut n) => {
                        *n -= 1;
                        Some(plan.fatal)
                    }
                    None => Some(plan.fatal),
                },
                None => None,
            };

            match verdict {
                None => {
                    s.actions.push(DeviceAction::Submit(address));
                    Ok(())
                }
                Some(fatal) => {
                    s.actions.push(DeviceAction::FailedSubmit(address));
                    let detail = format!("input at {} rejected", address);
                    if fatal {
                        Err(DeviceError::Fatal(detail))
                    } else {
                        Err(DeviceError::Transient(detail))
                    }
                }
            }
        })
    }
}

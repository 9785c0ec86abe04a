//! Control-pipe state machine for endpoint 0 (USB 2.0 §8.5.3, §9.3).
//!
//! This module owns only the state transitions; it has no idea how to
//! talk to hardware. [`crate::device`] drives it: on each setup-received
//! or transfer-complete event it calls one of the `on_*` methods here,
//! gets back an [`Action`] describing what to do next, and carries that
//! out against the real endpoints/controller.

use crate::endpoint::SetupPacket;
use crate::request::Response;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    InData,
    OutData,
    WaitInStatus,
    WaitOutStatus,
}

/// What the caller should do in response to an event just fed to the
/// state machine.
#[cfg_attr(feature = "std", derive(Debug))]
pub enum Action<'a> {
    /// Queue `bytes` on the IN endpoint, then arm a zero-length OUT for
    /// the status stage once it completes.
    SendData(&'a [u8]),
    /// Arm a zero-length OUT to receive the data stage; the handler
    /// will be re-invoked with `Stage::Data` once it lands (not used by
    /// any mandatory standard request, but reachable from a class/vendor
    /// override).
    ReceiveData,
    /// Arm a zero-length IN immediately (no data stage).
    StatusIn,
    /// Stall both directions of endpoint 0 and return to idle.
    Stall,
    /// Nothing to do (an event the state machine consumed silently, e.g.
    /// a status-stage completion).
    None,
}

/// The endpoint-0 control transfer state machine, independent of which
/// pair of hardware endpoints it rides on.
pub struct ControlPipe {
    state: State,
}

impl Default for ControlPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPipe {
    pub const fn new() -> Self {
        Self { state: State::Idle }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// A setup packet just landed (`ENDPTSETUPSTAT` was set for this
    /// endpoint). Per USB 2.0 §8.5.3, a new setup packet aborts whatever
    /// sequence was in progress — the caller is expected to have already
    /// flushed both directions of endpoint 0 before calling this if
    /// `self.state` wasn't `Idle`.
    ///
    /// `response` is the handler's verdict for the just-received setup
    /// stage (already computed by the caller, since producing it may
    /// need the handler to see IDLE->SETUP dispatch first).
    pub fn on_setup<'a>(&mut self, setup: SetupPacket, response: Response<'a>) -> Action<'a> {
        match response {
            Response::DataIn(bytes) if setup.is_device_to_host() && setup.length != 0 => {
                self.state = State::InData;
                Action::SendData(bytes)
            }
            Response::DataIn(_) => {
                // Handler wants to send data, but the host asked for
                // none (wLength == 0) or this is an OUT-direction
                // request: treat as a status-only ack.
                self.state = State::WaitInStatus;
                Action::StatusIn
            }
            Response::DataOut if !setup.is_device_to_host() && setup.length != 0 => {
                self.state = State::OutData;
                Action::ReceiveData
            }
            Response::DataOut => {
                self.state = State::WaitInStatus;
                Action::StatusIn
            }
            Response::None => {
                self.state = State::WaitInStatus;
                Action::StatusIn
            }
            Response::Stall => {
                self.state = State::Idle;
                Action::Stall
            }
        }
    }

    /// The IN data stage just finished transmitting. Move to waiting for
    /// the host's zero-length OUT status packet.
    pub fn on_in_data_complete(&mut self) -> Action<'static> {
        match self.state {
            State::InData => {
                self.state = State::WaitOutStatus;
                Action::None
            }
            _ => Action::None,
        }
    }

    /// The OUT data stage just finished receiving. Arm the zero-length
    /// IN status packet.
    pub fn on_out_data_complete(&mut self) -> Action<'static> {
        match self.state {
            State::OutData => {
                self.state = State::WaitInStatus;
                Action::StatusIn
            }
            _ => Action::None,
        }
    }

    /// The status stage (whichever direction) just completed. Always
    /// returns to idle.
    pub fn on_status_complete(&mut self) -> Action<'static> {
        match self.state {
            State::WaitInStatus | State::WaitOutStatus => {
                self.state = State::Idle;
                Action::None
            }
            _ => Action::None,
        }
    }

    /// Force the state machine back to idle without running any
    /// transition logic — used when the caller is aborting the sequence
    /// itself (bus reset, endpoint disable).
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }
}

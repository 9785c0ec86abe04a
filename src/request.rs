//! Chapter 9 standard request dispatcher (USB 2.0 §9.4).
//!
//! `standard_request` is a pure-ish function of the current setup packet,
//! stage, and the device's descriptor/configuration table plus a small
//! bit of dispatcher state (pending address, selected configuration,
//! interface alternate settings) — everything it needs to decide what to
//! do is passed in, so it can be unit-tested without any hardware
//! behind it. [`crate::control_pipe`] is the caller; it turns a
//! [`Response`] into actual scheduled transfers.

use crate::descriptor::{self, Configuration, DeviceDescriptor, DeviceQualifierDescriptor};
use crate::endpoint::SetupPacket;

pub mod standard_request_code {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
    pub const SYNCH_FRAME: u8 = 12;
}

pub const FEATURE_ENDPOINT_HALT: u16 = 0;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Data,
    Status,
}

/// What the control pipe should do in response to a setup packet (or a
/// later data/status stage of the same transfer). Borrows either a
/// `'static` descriptor table or the caller's scratch buffer, so `'a` is
/// tied to whichever of those backs a given `DataIn`.
#[cfg_attr(feature = "std", derive(Debug))]
pub enum Response<'a> {
    /// Send this many bytes back to the host on the IN direction, then
    /// ack with a zero-length OUT.
    DataIn(&'a [u8]),
    /// Expect the host to send data on the OUT direction (not used by
    /// any request in the mandatory subset, but part of the general
    /// contract for class/vendor overrides), then ack with a
    /// zero-length IN.
    DataOut,
    /// No data stage; ack with a zero-length IN immediately.
    None,
    /// Malformed or unsupported request: stall both directions of
    /// endpoint 0.
    Stall,
}

/// Mutable dispatcher state that outlives any single setup packet:
/// the address latched by a pending `SET_ADDRESS` (applied once the
/// status stage completes — see [`crate::controller::ControllerInfo::set_address_deferred`]),
/// which configuration (if any) is selected, and each interface's
/// current alternate setting.
#[derive(Default)]
pub struct DispatcherState {
    pub configuration_index: Option<usize>,
}

/// Minimal standing device identity `standard_request` needs: the
/// descriptors it answers `GET_DESCRIPTOR` from, and what's actually
/// configured right now.
pub struct DeviceIdentity {
    pub descriptor: &'static DeviceDescriptor,
    pub qualifier: Option<&'static DeviceQualifierDescriptor>,
    pub configurations: &'static [Configuration<'static>],
    pub langids: &'static [u16],
    pub strings: &'static [&'static str],
    pub speed: crate::controller::Speed,
}

fn min_u16(a: u16, b: usize) -> usize {
    (a as usize).min(b)
}

/// Encode a string descriptor for `index` into `scratch`, returning the
/// slice actually used. Index 0 returns the LANGID table.
fn string_descriptor<'a>(identity: &DeviceIdentity, index: u8, scratch: &'a mut [u8; 256]) -> Option<&'a [u8]> {
    if index == 0 {
        let n = descriptor::langid_table_descriptor(identity.langids, scratch);
        return Some(&scratch[..n]);
    }
    let s = identity.strings.get((index - 1) as usize)?;
    let n = descriptor::encode_string_descriptor(s, scratch)?;
    Some(&scratch[..n])
}

/// Dispatch one standard request. `scratch` backs any descriptor this
/// call needs to synthesize on the fly (string descriptors); descriptors
/// that already exist as `'static` byte slices (device, configuration)
/// are returned by reference without copying.
///
/// Only the `Stage::Setup` call can change `Response`; `Stage::Data`/
/// `Stage::Status` calls exist so the dispatcher can react to a
/// completed data or status stage (there is none to react to for any
/// request in the mandatory subset, so those stages always return
/// `Response::None` here — they're still part of the signature so a
/// class/vendor handler installed in the same slot can do something
/// with them).
pub fn standard_request<'a>(
    identity: &DeviceIdentity,
    state: &mut DispatcherState,
    setup: SetupPacket,
    stage: Stage,
    scratch: &'a mut [u8; 256],
) -> Response<'a> {
    if stage != Stage::Setup {
        return Response::None;
    }

    match setup.request {
        standard_request_code::GET_STATUS => {
            // Self-powered/remote-wakeup and halt bits aren't modeled;
            // report all-zero status, which is always a legal answer.
            scratch[0] = 0;
            scratch[1] = 0;
            Response::DataIn(&scratch[..2])
        }

        standard_request_code::CLEAR_FEATURE | standard_request_code::SET_FEATURE => {
            if setup.recipient() == 2 && setup.value == FEATURE_ENDPOINT_HALT {
                Response::None
            } else {
                Response::Stall
            }
        }

        standard_request_code::SET_ADDRESS => Response::None,

        standard_request_code::GET_DESCRIPTOR => {
            let descriptor_type = (setup.value >> 8) as u8;
            let descriptor_index = (setup.value & 0xff) as u8;
            match descriptor_type {
                descriptor::descriptor_type::DEVICE => {
                    let bytes = identity.descriptor.as_bytes();
                    Response::DataIn(&bytes[..min_u16(setup.length, bytes.len())])
                }
                descriptor::descriptor_type::DEVICE_QUALIFIER => match identity.qualifier {
                    Some(q) => {
                        let bytes = q.as_bytes();
                        Response::DataIn(&bytes[..min_u16(setup.length, bytes.len())])
                    }
                    None => Response::Stall,
                },
                descriptor::descriptor_type::CONFIGURATION | descriptor::descriptor_type::OTHER_SPEED_CONFIGURATION => {
                    match identity.configurations.get(descriptor_index as usize) {
                        Some(config) => Response::DataIn(config.response(setup.length)),
                        None => Response::Stall,
                    }
                }
                descriptor::descriptor_type::STRING => match string_descriptor(identity, descriptor_index, scratch) {
                    Some(bytes) => {
                        let n = min_u16(setup.length, bytes.len());
                        Response::DataIn(&bytes[..n])
                    }
                    None => Response::Stall,
                },
                _ => Response::Stall,
            }
        }

        standard_request_code::SET_DESCRIPTOR => Response::Stall,

        standard_request_code::GET_CONFIGURATION => {
            scratch[0] = state
                .configuration_index
                .map(|i| identity.configurations[i].number)
                .unwrap_or(0);
            Response::DataIn(&scratch[..1])
        }

        standard_request_code::SET_CONFIGURATION => {
            let wanted = (setup.value & 0xff) as u8;
            if wanted == 0 {
                state.configuration_index = None;
                Response::None
            } else {
                let found = identity
                    .configurations
                    .iter()
                    .position(|c| c.number == wanted && c.speed == identity.speed);
                match found {
                    Some(i) => {
                        state.configuration_index = Some(i);
                        Response::None
                    }
                    None => Response::Stall,
                }
            }
        }

        standard_request_code::GET_INTERFACE => {
            scratch[0] = 0;
            Response::DataIn(&scratch[..1])
        }

        standard_request_code::SET_INTERFACE => {
            if setup.value == 0 {
                Response::None
            } else {
                Response::Stall
            }
        }

        standard_request_code::SYNCH_FRAME => Response::Stall,

        _ => Response::Stall,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Speed;

    const DEVICE: DeviceDescriptor = DeviceDescriptor {
        bLength: 18,
        bDescriptorType: descriptor::descriptor_type::DEVICE,
        bcdUSB: [0x00, 0x02],
        bDeviceClass: 0,
        bDeviceSubClass: 0,
        bDeviceProtocol: 0,
        bMaxPacketSize0: 64,
        idVendor: [0x34, 0x12],
        idProduct: [0x78, 0x56],
        bcdDevice: [0x00, 0x01],
        iManufacturer: 0,
        iProduct: 0,
        iSerialNumber: 0,
        bNumConfigurations: 1,
    };

    const CONFIG_TREE: &[u8] = &[
        9, 2, 18, 0, 1, 1, 0, 0x80, 50, // configuration header, wTotalLength=18
        9, 4, 0, 0, 0, 0xff, 0, 0, 0, // interface, 0 endpoints
    ];

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            descriptor: &DEVICE,
            qualifier: None,
            configurations: &[Configuration {
                tree: CONFIG_TREE,
                number: 1,
                speed: Speed::Full,
            }],
            langids: &[0x0409],
            strings: &[],
            speed: Speed::Full,
        }
    }

    fn setup(request: u8, value: u16, length: u16) -> SetupPacket {
        SetupPacket {
            request_type: 0x80,
            request,
            value,
            index: 0,
            length,
        }
    }

    #[test]
    fn get_descriptor_device_truncates_to_blength() {
        let id = identity();
        let mut state = DispatcherState::default();
        let mut scratch = [0u8; 256];
        let r = standard_request(
            &id,
            &mut state,
            setup(standard_request_code::GET_DESCRIPTOR, 0x0100, 8),
            Stage::Setup,
            &mut scratch,
        );
        match r {
            Response::DataIn(bytes) => assert_eq!(bytes.len(), 8),
            _ => panic!("expected DataIn"),
        }
    }

    #[test]
    fn get_descriptor_configuration_truncates_to_total_length() {
        let id = identity();
        let mut state = DispatcherState::default();
        let mut scratch = [0u8; 256];
        let r = standard_request(
            &id,
            &mut state,
            setup(standard_request_code::GET_DESCRIPTOR, 0x0200, 0xffff),
            Stage::Setup,
            &mut scratch,
        );
        match r {
            Response::DataIn(bytes) => assert_eq!(bytes.len(), CONFIG_TREE.len()),
            _ => panic!("expected DataIn"),
        }
    }

    #[test]
    fn set_configuration_unknown_number_stalls() {
        let id = identity();
        let mut state = DispatcherState::default();
        let mut scratch = [0u8; 256];
        let r = standard_request(
            &id,
            &mut state,
            setup(standard_request_code::SET_CONFIGURATION, 0x0099, 0),
            Stage::Setup,
            &mut scratch,
        );
        assert!(matches!(r, Response::Stall));
    }

    #[test]
    fn set_configuration_then_get_configuration_round_trips() {
        let id = identity();
        let mut state = DispatcherState::default();
        let mut scratch = [0u8; 256];
        let r = standard_request(
            &id,
            &mut state,
            setup(standard_request_code::SET_CONFIGURATION, 0x0001, 0),
            Stage::Setup,
            &mut scratch,
        );
        assert!(matches!(r, Response::None));

        let r = standard_request(
            &id,
            &mut state,
            setup(standard_request_code::GET_CONFIGURATION, 0, 1),
            Stage::Setup,
            &mut scratch,
        );
        match r {
            Response::DataIn(bytes) => assert_eq!(bytes[0], 1),
            _ => panic!("expected DataIn"),
        }
    }

    #[test]
    fn set_configuration_zero_clears_selection() {
        let id = identity();
        let mut state = DispatcherState {
            configuration_index: Some(0),
        };
        let mut scratch = [0u8; 256];
        let r = standard_request(
            &id,
            &mut state,
            setup(standard_request_code::SET_CONFIGURATION, 0, 0),
            Stage::Setup,
            &mut scratch,
        );
        assert!(matches!(r, Response::None));
        assert_eq!(state.configuration_index, None);
    }

    #[test]
    fn clear_feature_on_non_endpoint_halt_stalls() {
        let id = identity();
        let mut state = DispatcherState::default();
        let mut scratch = [0u8; 256];
        let mut s = setup(standard_request_code::CLEAR_FEATURE, 1, 0);
        s.request_type = 0x00; // recipient = device
        let r = standard_request(&id, &mut state, s, Stage::Setup, &mut scratch);
        assert!(matches!(r, Response::Stall));
    }

    #[test]
    fn set_descriptor_always_stalls() {
        let id = identity();
        let mut state = DispatcherState::default();
        let mut scratch = [0u8; 256];
        let r = standard_request(
            &id,
            &mut state,
            setup(standard_request_code::SET_DESCRIPTOR, 0, 0),
            Stage::Setup,
            &mut scratch,
        );
        assert!(matches!(r, Response::Stall));
    }
}

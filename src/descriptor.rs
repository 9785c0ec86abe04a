//! Packed USB 2.0 descriptor layouts (USB 2.0 §9.6) and the walk helpers
//! used to answer `GET_DESCRIPTOR` and to recover an endpoint's declared
//! type/max-packet-size from the active configuration's descriptor tree.
//!
//! Every multi-byte field that isn't itself a `u8` is stored as `[u8; N]`
//! rather than a native integer so that `#[repr(C)]` matches the wire
//! layout exactly regardless of host endianness; accessors decode
//! little-endian explicitly.

#![allow(non_snake_case)] // field names follow USB 2.0 table numbering

/// `bDescriptorType` values (USB 2.0 table 9-5).
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const DEVICE_QUALIFIER: u8 = 6;
    pub const OTHER_SPEED_CONFIGURATION: u8 = 7;
}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, bytemuck::Zeroable, bytemuck::Pod)]
pub struct DeviceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: [u8; 2],
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub idVendor: [u8; 2],
    pub idProduct: [u8; 2],
    pub bcdDevice: [u8; 2],
    pub iManufacturer: u8,
    pub iProduct: u8,
    pub iSerialNumber: u8,
    pub bNumConfigurations: u8,
}

impl DeviceDescriptor {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, bytemuck::Zeroable, bytemuck::Pod)]
pub struct DeviceQualifierDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: [u8; 2],
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub bNumConfigurations: u8,
    pub bReserved: u8,
}

impl DeviceQualifierDescriptor {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, bytemuck::Zeroable, bytemuck::Pod)]
pub struct ConfigurationDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub wTotalLength: [u8; 2],
    pub bNumInterfaces: u8,
    pub bConfigurationValue: u8,
    pub iConfiguration: u8,
    pub bmAttributes: u8,
    pub bMaxPower: u8,
}

impl ConfigurationDescriptor {
    pub fn total_length(&self) -> u16 {
        u16::from_le_bytes(self.wTotalLength)
    }
}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, bytemuck::Zeroable, bytemuck::Pod)]
pub struct InterfaceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, bytemuck::Zeroable, bytemuck::Pod)]
pub struct EndpointDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bEndpointAddress: u8,
    pub bmAttributes: u8,
    pub wMaxPacketSize: [u8; 2],
    pub bInterval: u8,
}

impl EndpointDescriptor {
    pub fn max_packet_size(&self) -> u16 {
        u16::from_le_bytes(self.wMaxPacketSize)
    }

    /// Transfer type from `bmAttributes` bits 1:0 (USB 2.0 table 9-13).
    pub fn transfer_type(&self) -> crate::endpoint::TransferType {
        crate::endpoint::TransferType::from_bits(self.bmAttributes & 0x3)
    }
}

/// A visitor over a flattened configuration descriptor tree, in the spirit
/// of a SAX parser: each sub-descriptor is handed to the matching callback
/// as it's encountered, in tree order.
pub trait DescriptorVisitor {
    fn on_configuration(&mut self, _c: &ConfigurationDescriptor) {}
    fn on_interface(&mut self, _i: &InterfaceDescriptor) {}
    fn on_endpoint(&mut self, _e: &EndpointDescriptor) {}
    fn on_other(&mut self, _bytes: &[u8]) {}
}

/// Walk a configuration descriptor tree (header + interfaces + endpoints,
/// concatenated exactly as `wTotalLength` describes) calling `v` for each
/// sub-descriptor. Stops at the first malformed (too-short, truncated)
/// entry rather than panicking.
pub fn walk(bytes: &[u8], v: &mut impl DescriptorVisitor) {
    let mut index = 0;
    while bytes.len() > index + 2 {
        let dlen = bytes[index] as usize;
        let dtype = bytes[index + 1];

        if dlen < 2 || bytes.len() < index + dlen {
            return;
        }

        let chunk = &bytes[index..index + dlen];
        match dtype {
            descriptor_type::CONFIGURATION => {
                if let Ok(c) = bytemuck::try_from_bytes(chunk) {
                    v.on_configuration(c);
                }
            }
            descriptor_type::INTERFACE => {
                if let Ok(i) = bytemuck::try_from_bytes(chunk) {
                    v.on_interface(i);
                }
            }
            descriptor_type::ENDPOINT => {
                if let Ok(e) = bytemuck::try_from_bytes(chunk) {
                    v.on_endpoint(e);
                }
            }
            _ => v.on_other(chunk),
        }

        index += dlen;
    }
}

struct FindEndpoint {
    address: u8,
    found: Option<EndpointDescriptor>,
}

impl DescriptorVisitor for FindEndpoint {
    fn on_endpoint(&mut self, e: &EndpointDescriptor) {
        if self.found.is_none() && e.bEndpointAddress == self.address {
            self.found = Some(*e);
        }
    }
}

/// Find the endpoint descriptor for `address` inside a configuration
/// descriptor tree. Used by `endpoint_init` to recover the declared
/// type/max-packet-size for an endpoint once a configuration is active.
pub fn find_endpoint(config_tree: &[u8], address: u8) -> Option<EndpointDescriptor> {
    let mut finder = FindEndpoint { address, found: None };
    walk(config_tree, &mut finder);
    finder.found
}

/// A registered configuration: its descriptor tree (header, interfaces and
/// endpoints concatenated, per USB 2.0 §9.6.3), its 1-based configuration
/// number, and the speed at which this tree applies.
#[derive(Clone, Copy)]
pub struct Configuration<'a> {
    pub tree: &'a [u8],
    pub number: u8,
    pub speed: crate::controller::Speed,
}

impl<'a> Configuration<'a> {
    pub fn header(&self) -> Option<&'a ConfigurationDescriptor> {
        if self.tree.len() < core::mem::size_of::<ConfigurationDescriptor>() {
            return None;
        }
        bytemuck::try_from_bytes(&self.tree[..core::mem::size_of::<ConfigurationDescriptor>()]).ok()
    }

    pub fn endpoint_descriptor(&self, address: u8) -> Option<EndpointDescriptor> {
        find_endpoint(self.tree, address)
    }

    /// Bytes to return for `GET_DESCRIPTOR(CONFIGURATION)`, truncated to
    /// `min(wLength, wTotalLength)` as USB 2.0 §9.4.3 requires.
    pub fn response(&self, w_length: u16) -> &'a [u8] {
        let total = self.header().map(|h| h.total_length() as usize).unwrap_or(self.tree.len());
        let total = total.min(self.tree.len());
        let n = (w_length as usize).min(total);
        &self.tree[..n]
    }
}

/// String descriptor index 0 is special: it returns the table of
/// supported LANGIDs instead of a string, per USB 2.0 §9.6.7.
pub fn langid_table_descriptor(langids: &[u16], out: &mut [u8]) -> usize {
    let len = 2 + langids.len() * 2;
    out[0] = len as u8;
    out[1] = descriptor_type::STRING;
    for (i, id) in langids.iter().enumerate() {
        let b = id.to_le_bytes();
        out[2 + i * 2] = b[0];
        out[2 + i * 2 + 1] = b[1];
    }
    len
}

/// Encode a UTF-16LE string descriptor (bLength, bDescriptorType = STRING,
/// then the UTF-16LE code units, no terminator) into `out`. Returns the
/// number of bytes written, or `None` if `out` is too small.
pub fn encode_string_descriptor(s: &str, out: &mut [u8]) -> Option<usize> {
    let mut len = 2;
    for c in s.encode_utf16() {
        let idx = len;
        if idx + 2 > out.len() {
            return None;
        }
        let b = c.to_le_bytes();
        out[idx] = b[0];
        out[idx + 1] = b[1];
        len += 2;
    }
    if len > 255 {
        return None;
    }
    out[0] = len as u8;
    out[1] = descriptor_type::STRING;
    Some(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ELLA: &[u8] = &[
        9, 2, 180, 1, 5, 1, 0, 128, 250, 9, 4, 0, 0, 4, 255, 0, 3, 0, 12, 95, 1, 0, 10, 0, 4, 4, 1, 0, 4, 0, 7, 5, 2,
        2, 0, 2, 0, 7, 5, 8, 2, 0, 2, 0,
    ];

    #[derive(Default)]
    struct Counts {
        configurations: u32,
        interfaces: u32,
        endpoints: u32,
    }

    impl DescriptorVisitor for Counts {
        fn on_configuration(&mut self, _c: &ConfigurationDescriptor) {
            self.configurations += 1;
        }
        fn on_interface(&mut self, _i: &InterfaceDescriptor) {
            self.interfaces += 1;
        }
        fn on_endpoint(&mut self, _e: &EndpointDescriptor) {
            self.endpoints += 1;
        }
    }

    #[test]
    fn walks_configuration_tree() {
        let mut counts = Counts::default();
        walk(ELLA, &mut counts);
        assert_eq!(counts.configurations, 1);
        assert_eq!(counts.interfaces, 1);
        assert_eq!(counts.endpoints, 2);
    }

    #[test]
    fn finds_endpoint_by_address() {
        let ep = find_endpoint(ELLA, 0x82).unwrap();
        assert_eq!(ep.bEndpointAddress, 0x82);
        assert_eq!(ep.max_packet_size(), 512);
    }

    #[test]
    fn missing_endpoint_is_none() {
        assert!(find_endpoint(ELLA, 0x7f).is_none());
    }

    #[test]
    fn configuration_response_truncates_to_wlength() {
        let config = Configuration {
            tree: ELLA,
            number: 1,
            speed: crate::controller::Speed::High,
        };
        assert_eq!(config.response(9).len(), 9);
        assert_eq!(config.response(0xffff).len(), ELLA.len());
        assert_eq!(config.header().unwrap().total_length() as usize, ELLA.len());
    }

    #[test]
    fn string_descriptor_round_trips_length_prefix() {
        let mut buf = [0u8; 32];
        let n = encode_string_descriptor("Hi", &mut buf).unwrap();
        assert_eq!(n, 6);
        assert_eq!(buf[0], 6);
        assert_eq!(buf[1], descriptor_type::STRING);
    }

    #[test]
    fn langid_table_reports_index_zero() {
        let mut buf = [0u8; 8];
        let n = langid_table_descriptor(&[0x0409], &mut buf);
        assert_eq!(n, 4);
        assert_eq!(buf[0], 4);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 0x0409);
    }
}

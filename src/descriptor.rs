//! USB descriptor model and parsing.
//!
//! A USB device describes itself through a handful of fixed binary records:
//!
//! 1. A device descriptor (vendor/product identity, class codes, versions)
//! 2. A configuration descriptor, which embeds
//! 3. Interface descriptors (one per alternate setting), each followed by
//! 4. Endpoint descriptors, and optionally
//! 5. Interface association descriptors grouping interfaces into functions
//!    on composite devices
//!
//! [`Configuration::parse`] turns the raw configuration descriptor, exactly
//! as returned by the device, into an immutable tree of [`Function`],
//! [`Interface`], [`AlternateSetting`] and [`Endpoint`] values. The parser is
//! a pure function: no I/O, no locking, and it never mutates its input. All
//! multi-byte fields are little-endian and packed, and are read byte-wise so
//! the code is independent of host endianness and alignment.
//!
//! # Resources
//! - <https://www.keil.com/pack/doc/mw/USB/html/_u_s_b__descriptors.html>

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Error, Result};

pub(crate) const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub(crate) const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub(crate) const DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub(crate) const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub(crate) const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub(crate) const DESCRIPTOR_TYPE_INTERFACE_ASSOCIATION: u8 = 0x0b;

const DEVICE_DESCRIPTOR_LENGTH: usize = 18;
const CONFIGURATION_HEADER_LENGTH: usize = 9;
const INTERFACE_DESCRIPTOR_LENGTH: usize = 9;
const INTERFACE_ASSOCIATION_LENGTH: usize = 8;
const ENDPOINT_DESCRIPTOR_LENGTH: usize = 7;

/// Direction of an endpoint or transfer, as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

impl Direction {
    pub(crate) fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// The direction bit of an endpoint address byte.
    pub(crate) fn bit(self) -> u8 {
        match self {
            Direction::Out => 0x00,
            Direction::In => 0x80,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => write!(f, "OUT"),
            Direction::In => write!(f, "IN"),
        }
    }
}

/// Transfer type of an endpoint, from the low two bits of the endpoint
/// descriptor's attributes byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TransferType {
    /// Control transfers. Only endpoint 0, which never appears in a
    /// configuration descriptor.
    Control = 0,
    /// Isochronous transfers.
    Isochronous = 1,
    /// Bulk transfers.
    Bulk = 2,
    /// Interrupt transfers.
    Interrupt = 3,
}

/// Class code triple of a device, function, or alternate setting.
///
/// Contains the class, subclass, and protocol codes as assigned by USB-IF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassCodes {
    class: u8,
    subclass: u8,
    protocol: u8,
}

impl ClassCodes {
    fn new(class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            class,
            subclass,
            protocol,
        }
    }

    /// Class code.
    #[must_use]
    pub fn class(&self) -> u8 {
        self.class
    }

    /// Subclass code.
    #[must_use]
    pub fn subclass(&self) -> u8 {
        self.subclass
    }

    /// Protocol code.
    #[must_use]
    pub fn protocol(&self) -> u8 {
        self.protocol
    }
}

/// A packed binary-coded-decimal version number, as used for the USB
/// specification release (`bcdUSB`) and device release (`bcdDevice`) fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(u16);

impl Version {
    pub(crate) fn from_bcd(bcd: u16) -> Self {
        Version(bcd)
    }

    /// Major version number.
    #[must_use]
    pub fn major(&self) -> u8 {
        let tens = ((self.0 >> 12) & 0x0f) as u8;
        let ones = ((self.0 >> 8) & 0x0f) as u8;
        tens * 10 + ones
    }

    /// Minor version number.
    #[must_use]
    pub fn minor(&self) -> u8 {
        ((self.0 >> 4) & 0x0f) as u8
    }

    /// Sub-minor version number.
    #[must_use]
    pub fn subminor(&self) -> u8 {
        (self.0 & 0x0f) as u8
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.subminor())
    }
}

/// An endpoint of an alternate setting.
///
/// The endpoint number (1–127) does not carry the direction; the full
/// endpoint address byte is available through [`Endpoint::address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    number: u8,
    direction: Direction,
    transfer_type: TransferType,
    max_packet_size: u16,
    interval: u8,
}

impl Endpoint {
    /// Endpoint number (1–127), without the direction bit.
    #[must_use]
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Transfer direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Transfer type.
    #[must_use]
    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    /// Maximum packet size in bytes.
    #[must_use]
    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    /// Polling interval for interrupt and isochronous endpoints.
    #[must_use]
    pub fn interval(&self) -> u8 {
        self.interval
    }

    /// The endpoint address byte: number plus direction bit.
    #[must_use]
    pub fn address(&self) -> u8 {
        self.number | self.direction.bit()
    }
}

/// One alternate setting of an interface: a class code triple and the set of
/// endpoints available while the setting is selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateSetting {
    number: u8,
    class_codes: ClassCodes,
    endpoints: Vec<Endpoint>,
}

impl AlternateSetting {
    /// Alternate setting number.
    #[must_use]
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Class code triple of the interface while this setting is selected.
    #[must_use]
    pub fn class_codes(&self) -> ClassCodes {
        self.class_codes
    }

    /// The endpoints of this setting, sorted by endpoint number. The control
    /// endpoint 0 is implicit and never listed.
    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Look up an endpoint by number and direction.
    #[must_use]
    pub fn endpoint(&self, number: u8, direction: Direction) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|ep| ep.number == number && ep.direction == direction)
    }
}

/// An interface of a configuration, with all its alternate settings.
///
/// Which alternate setting is *currently selected*, and whether the interface
/// is claimed, is state of the open device, not of this immutable
/// description; see [`Device::current_alternate`](crate::Device::current_alternate)
/// and [`Device::is_interface_claimed`](crate::Device::is_interface_claimed).
#[derive(Debug, Clone)]
pub struct Interface {
    number: u8,
    alternates: Vec<Arc<AlternateSetting>>,
}

impl Interface {
    /// Interface number. Interfaces are numbered from 0 and are usually, but
    /// not necessarily, contiguous.
    #[must_use]
    pub fn number(&self) -> u8 {
        self.number
    }

    /// All alternate settings of this interface, ordered by setting number.
    /// Never empty; the first entry is the default setting.
    #[must_use]
    pub fn alternates(&self) -> &[Arc<AlternateSetting>] {
        &self.alternates
    }

    /// Look up an alternate setting by number.
    #[must_use]
    pub fn alternate(&self, number: u8) -> Option<&Arc<AlternateSetting>> {
        self.alternates.iter().find(|alt| alt.number == number)
    }
}

/// A grouping of consecutive interfaces into one logical function, taken from
/// an interface association descriptor. Present only on composite devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function {
    first_interface: u8,
    interface_count: u8,
    class_codes: ClassCodes,
}

impl Function {
    /// Number of the first interface belonging to this function.
    #[must_use]
    pub fn first_interface(&self) -> u8 {
        self.first_interface
    }

    /// Number of consecutive interfaces belonging to this function.
    #[must_use]
    pub fn interface_count(&self) -> u8 {
        self.interface_count
    }

    /// Class code triple of the function as a whole.
    #[must_use]
    pub fn class_codes(&self) -> ClassCodes {
        self.class_codes
    }
}

/// A parsed USB configuration: the navigable tree of functions, interfaces,
/// alternate settings and endpoints described by one configuration
/// descriptor.
#[derive(Debug, Clone)]
pub struct Configuration {
    value: u8,
    attributes: u8,
    max_power: u8,
    functions: Vec<Function>,
    interfaces: Vec<Interface>,
}

impl Configuration {
    /// The configuration value used with `SET_CONFIGURATION`.
    #[must_use]
    pub fn configuration_value(&self) -> u8 {
        self.value
    }

    /// The raw attributes byte (self-powered, remote wakeup).
    #[must_use]
    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    /// Maximum power draw of the configuration, in units of 2 mA.
    #[must_use]
    pub fn max_power(&self) -> u8 {
        self.max_power
    }

    /// The functions of a composite device. Empty when the configuration
    /// carries no interface association descriptors.
    #[must_use]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// The interfaces of this configuration, sorted by interface number.
    #[must_use]
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Look up an interface by number.
    #[must_use]
    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|iface| iface.number == number)
    }

    /// Parse a full configuration descriptor as returned by the device.
    ///
    /// The buffer must contain exactly the number of bytes declared in the
    /// header's total-length field; both a truncated and a padded buffer are
    /// rejected. Class- and vendor-specific records are skipped by their
    /// declared length, everything else must appear where the configuration
    /// grammar expects it.
    pub fn parse(bytes: &[u8]) -> Result<Configuration> {
        if bytes.len() < CONFIGURATION_HEADER_LENGTH {
            return Err(invalid(format!(
                "configuration descriptor too short: {} bytes, need at least {}",
                bytes.len(),
                CONFIGURATION_HEADER_LENGTH
            )));
        }
        if bytes[1] != DESCRIPTOR_TYPE_CONFIGURATION {
            return Err(invalid("invalid USB configuration descriptor"));
        }
        let total_length = usize::from(read_u16(bytes, 2));
        if bytes.len() < total_length {
            return Err(invalid(format!(
                "configuration descriptor too short: header declares {} bytes, buffer has {}",
                total_length,
                bytes.len()
            )));
        }
        if bytes.len() > total_length {
            return Err(invalid(format!(
                "configuration descriptor too long: header declares {} bytes, buffer has {}",
                total_length,
                bytes.len()
            )));
        }
        let header_length = usize::from(bytes[0]);
        if header_length < CONFIGURATION_HEADER_LENGTH || header_length > bytes.len() {
            return Err(invalid("invalid USB configuration descriptor"));
        }

        let mut parser = Parser::default();
        let mut offset = header_length;
        while offset < bytes.len() {
            let remaining = &bytes[offset..];
            let record_length = usize::from(remaining[0]);
            if record_length == 0 {
                return Err(invalid("descriptor record with zero length"));
            }
            if record_length < 2 {
                return Err(invalid("descriptor record too short"));
            }
            if record_length > remaining.len() {
                return Err(invalid(
                    "descriptor record extends past the end of the buffer",
                ));
            }
            parser.record(&remaining[..record_length])?;
            offset += record_length;
        }
        parser.finish(bytes[5], bytes[7], bytes[8])
    }
}

/// Incremental state of the configuration record walk.
#[derive(Default)]
struct Parser {
    functions: Vec<Function>,
    // interface number -> alternate settings, in parse order
    groups: BTreeMap<u8, Vec<AlternateSetting>>,
    // the interface alternate currently collecting endpoint records
    current: Option<(u8, AlternateSetting)>,
}

impl Parser {
    fn record(&mut self, record: &[u8]) -> Result<()> {
        match record[1] {
            DESCRIPTOR_TYPE_INTERFACE_ASSOCIATION => {
                if record.len() < INTERFACE_ASSOCIATION_LENGTH {
                    return Err(invalid("interface association descriptor too short"));
                }
                self.flush();
                self.functions.push(Function {
                    first_interface: record[2],
                    interface_count: record[3],
                    class_codes: ClassCodes::new(record[4], record[5], record[6]),
                });
            }
            DESCRIPTOR_TYPE_INTERFACE => {
                if record.len() < INTERFACE_DESCRIPTOR_LENGTH {
                    return Err(invalid("interface descriptor too short"));
                }
                self.flush();
                self.current = Some((
                    record[2],
                    AlternateSetting {
                        number: record[3],
                        class_codes: ClassCodes::new(record[5], record[6], record[7]),
                        endpoints: Vec::new(),
                    },
                ));
            }
            DESCRIPTOR_TYPE_ENDPOINT => {
                if record.len() < ENDPOINT_DESCRIPTOR_LENGTH {
                    return Err(invalid("endpoint descriptor too short"));
                }
                let Some((_, setting)) = self.current.as_mut() else {
                    // an endpoint record with no preceding interface record
                    return Err(invalid("invalid USB configuration descriptor"));
                };
                let address = record[2];
                let transfer_type = TransferType::try_from(record[3] & 0x03)
                    .map_err(|_| invalid("invalid USB configuration descriptor"))?;
                setting.endpoints.push(Endpoint {
                    number: address & 0x7f,
                    direction: Direction::from_address(address),
                    transfer_type,
                    // bits 11..16 only matter for high-bandwidth isochronous
                    max_packet_size: read_u16(record, 4) & 0x07ff,
                    interval: record[6],
                });
            }
            DESCRIPTOR_TYPE_DEVICE | DESCRIPTOR_TYPE_CONFIGURATION => {
                return Err(invalid("invalid USB configuration descriptor"));
            }
            // class- and vendor-specific records are skipped by length
            _ => {}
        }
        Ok(())
    }

    fn flush(&mut self) {
        if let Some((number, mut setting)) = self.current.take() {
            setting.endpoints.sort_by_key(Endpoint::number);
            self.groups.entry(number).or_default().push(setting);
        }
    }

    fn finish(mut self, value: u8, attributes: u8, max_power: u8) -> Result<Configuration> {
        self.flush();
        let interfaces = self
            .groups
            .into_iter()
            .map(|(number, mut alternates)| {
                alternates.sort_by_key(AlternateSetting::number);
                Interface {
                    number,
                    alternates: alternates.into_iter().map(Arc::new).collect(),
                }
            })
            .collect();
        Ok(Configuration {
            value,
            attributes,
            max_power,
            functions: self.functions,
            interfaces,
        })
    }
}

/// The fixed 18-byte device descriptor.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    usb_version: Version,
    class_codes: ClassCodes,
    max_packet_size_0: u8,
    vendor_id: u16,
    product_id: u16,
    device_version: Version,
    manufacturer_index: u8,
    product_index: u8,
    serial_number_index: u8,
    num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse a device descriptor. Extra trailing bytes are ignored, as some
    /// sources return the device descriptor with the configuration
    /// descriptors appended.
    pub fn parse(bytes: &[u8]) -> Result<DeviceDescriptor> {
        if bytes.len() < DEVICE_DESCRIPTOR_LENGTH {
            return Err(invalid(format!(
                "device descriptor too short: {} bytes, need {}",
                bytes.len(),
                DEVICE_DESCRIPTOR_LENGTH
            )));
        }
        if usize::from(bytes[0]) != DEVICE_DESCRIPTOR_LENGTH || bytes[1] != DESCRIPTOR_TYPE_DEVICE {
            return Err(invalid("invalid USB device descriptor"));
        }
        Ok(DeviceDescriptor {
            usb_version: Version::from_bcd(read_u16(bytes, 2)),
            class_codes: ClassCodes::new(bytes[4], bytes[5], bytes[6]),
            max_packet_size_0: bytes[7],
            vendor_id: read_u16(bytes, 8),
            product_id: read_u16(bytes, 10),
            device_version: Version::from_bcd(read_u16(bytes, 12)),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        })
    }

    /// USB specification release the device conforms to.
    #[must_use]
    pub fn usb_version(&self) -> Version {
        self.usb_version
    }

    /// Device-level class code triple.
    #[must_use]
    pub fn class_codes(&self) -> ClassCodes {
        self.class_codes
    }

    /// Maximum packet size of the control endpoint.
    #[must_use]
    pub fn max_packet_size_0(&self) -> u8 {
        self.max_packet_size_0
    }

    /// Vendor ID.
    #[must_use]
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    /// Product ID.
    #[must_use]
    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Device release number.
    #[must_use]
    pub fn device_version(&self) -> Version {
        self.device_version
    }

    /// String descriptor index of the manufacturer name, 0 if absent.
    #[must_use]
    pub fn manufacturer_index(&self) -> u8 {
        self.manufacturer_index
    }

    /// String descriptor index of the product name, 0 if absent.
    #[must_use]
    pub fn product_index(&self) -> u8 {
        self.product_index
    }

    /// String descriptor index of the serial number, 0 if absent.
    #[must_use]
    pub fn serial_number_index(&self) -> u8 {
        self.serial_number_index
    }

    /// Number of configurations the device offers.
    #[must_use]
    pub fn num_configurations(&self) -> u8 {
        self.num_configurations
    }
}

/// Decode a string descriptor into a `String`.
///
/// Device-supplied strings are UTF-16LE and not always well formed; invalid
/// code units are replaced rather than rejected, and trailing NUL units,
/// which compliant devices do not emit but real ones do, are trimmed.
pub fn parse_string_descriptor(bytes: &[u8]) -> Result<String> {
    if bytes.len() < 2 {
        return Err(invalid("string descriptor too short"));
    }
    if bytes[1] != DESCRIPTOR_TYPE_STRING {
        return Err(invalid("invalid USB string descriptor"));
    }
    let length = usize::from(bytes[0]).min(bytes.len());
    let mut units: Vec<u16> = bytes[2..length]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    while units.last() == Some(&0) {
        units.pop();
    }
    Ok(String::from_utf16_lossy(&units))
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidDescriptor(message.into())
}

/// Read a little-endian 16-bit field byte-wise. The caller has validated the
/// record length, so the slice is in bounds.
fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[cfg(test)]
mod test {
    use super::*;

    // assemble a configuration descriptor from records, patching the header's
    // total length to the real byte count
    fn config_bytes(records: &[&[u8]]) -> Vec<u8> {
        let mut bytes: Vec<u8> = records.concat();
        let total = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&total.to_le_bytes());
        bytes
    }

    const CONFIG_HEADER: &[u8] = &[9, 2, 0, 0, 1, 1, 0, 0x34, 0x64];

    #[test]
    fn parses_minimal_vendor_interface() {
        let bytes = [
            0x09, 0x02, 0x12, 0x00, 0x01, 0x01, 0x00, 0x34, 0x64, // configuration
            0x09, 0x04, 0x00, 0x00, 0x00, 0xff, 0xdd, 0xcc, 0x00, // interface 0 alt 0
        ];
        let config = Configuration::parse(&bytes).unwrap();
        assert_eq!(config.configuration_value(), 1);
        assert_eq!(config.attributes(), 0x34);
        assert_eq!(config.max_power(), 0x64);
        assert_eq!(config.interfaces().len(), 1);
        let iface = config.interface(0).unwrap();
        assert_eq!(iface.alternates().len(), 1);
        let alt = iface.alternate(0).unwrap();
        assert_eq!(alt.number(), 0);
        assert_eq!(alt.class_codes().class(), 0xff);
        assert_eq!(alt.class_codes().subclass(), 0xdd);
        assert_eq!(alt.class_codes().protocol(), 0xcc);
        assert!(alt.endpoints().is_empty());
        assert!(config.functions().is_empty());
    }

    #[test]
    fn rejects_truncated_and_padded_buffers() {
        let bytes = config_bytes(&[
            CONFIG_HEADER,
            &[9, 4, 0, 0, 0, 0xff, 0, 0, 0], // interface 0 alt 0
        ]);
        assert!(Configuration::parse(&bytes).is_ok());

        let err = Configuration::parse(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(&err, Error::InvalidDescriptor(msg) if msg.contains("too short")));

        let mut padded = bytes.clone();
        padded.push(0);
        let err = Configuration::parse(&padded).unwrap_err();
        assert!(matches!(&err, Error::InvalidDescriptor(msg) if msg.contains("too long")));
    }

    #[test]
    fn rejects_zero_length_record() {
        let bytes = config_bytes(&[CONFIG_HEADER, &[0, 0]]);
        let err = Configuration::parse(&bytes).unwrap_err();
        assert!(matches!(&err, Error::InvalidDescriptor(msg) if msg.contains("zero length")));
    }

    #[test]
    fn rejects_unexpected_structural_record() {
        // a device descriptor type byte inside the configuration
        let bytes = config_bytes(&[
            CONFIG_HEADER,
            &[9, 4, 0, 0, 0, 0xff, 0, 0, 0],
            &[18, 1, 0, 2, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0, 1, 0, 0, 0, 1],
        ]);
        let err = Configuration::parse(&bytes).unwrap_err();
        assert!(
            matches!(&err, Error::InvalidDescriptor(msg) if msg == "invalid USB configuration descriptor")
        );
    }

    #[test]
    fn rejects_endpoint_before_interface() {
        let bytes = config_bytes(&[CONFIG_HEADER, &[7, 5, 0x81, 0x02, 64, 0, 0]]);
        let err = Configuration::parse(&bytes).unwrap_err();
        assert!(
            matches!(&err, Error::InvalidDescriptor(msg) if msg == "invalid USB configuration descriptor")
        );
    }

    #[test]
    fn decodes_endpoint_fields() {
        let bytes = config_bytes(&[
            CONFIG_HEADER,
            &[9, 4, 0, 0, 2, 0xff, 0, 0, 0],
            &[7, 5, 0x81, 0x02, 0x40, 0x02, 0], // bulk IN 1, 576 bytes
            &[7, 5, 0x02, 0x03, 0x10, 0x00, 8], // interrupt OUT 2, 16 bytes
        ]);
        let config = Configuration::parse(&bytes).unwrap();
        let alt = config.interface(0).unwrap().alternate(0).unwrap().clone();
        assert_eq!(alt.endpoints().len(), 2);

        let ep_in = alt.endpoint(1, Direction::In).unwrap();
        assert_eq!(ep_in.transfer_type(), TransferType::Bulk);
        assert_eq!(ep_in.max_packet_size(), 0x0240);
        assert_eq!(ep_in.address(), 0x81);

        let ep_out = alt.endpoint(2, Direction::Out).unwrap();
        assert_eq!(ep_out.transfer_type(), TransferType::Interrupt);
        assert_eq!(ep_out.max_packet_size(), 16);
        assert_eq!(ep_out.interval(), 8);
        assert_eq!(ep_out.address(), 0x02);
    }

    #[test]
    fn high_packet_size_bits_are_masked() {
        let bytes = config_bytes(&[
            CONFIG_HEADER,
            &[9, 4, 0, 0, 1, 0xff, 0, 0, 0],
            // wMaxPacketSize 0x1400: high-bandwidth bits set, base size 1024
            &[7, 5, 0x81, 0x01, 0x00, 0x14, 1],
        ]);
        let config = Configuration::parse(&bytes).unwrap();
        let alt = config.interface(0).unwrap().alternate(0).unwrap().clone();
        let ep = alt.endpoint(1, Direction::In).unwrap();
        assert_eq!(ep.transfer_type(), TransferType::Isochronous);
        assert_eq!(ep.max_packet_size(), 0x0400);
    }

    #[test]
    fn groups_alternate_settings_by_interface() {
        let bytes = config_bytes(&[
            CONFIG_HEADER,
            &[9, 4, 0, 0, 1, 0xff, 0, 0, 0],
            &[7, 5, 0x81, 0x02, 64, 0, 0],
            &[9, 4, 0, 1, 1, 0xff, 0, 0, 0],
            &[7, 5, 0x81, 0x02, 0x00, 0x02, 0],
            &[9, 4, 1, 0, 0, 0x0a, 0, 0, 0],
        ]);
        let config = Configuration::parse(&bytes).unwrap();
        assert_eq!(config.interfaces().len(), 2);

        let iface0 = config.interface(0).unwrap();
        assert_eq!(iface0.alternates().len(), 2);
        // every interface has a non-empty alternate list whose first entry is
        // the default setting
        assert_eq!(iface0.alternates()[0].number(), 0);
        assert_eq!(iface0.alternate(0).unwrap().endpoints()[0].max_packet_size(), 64);
        assert_eq!(
            iface0.alternate(1).unwrap().endpoints()[0].max_packet_size(),
            512
        );

        let iface1 = config.interface(1).unwrap();
        assert_eq!(iface1.alternates().len(), 1);
        assert!(iface1.alternates()[0].endpoints().is_empty());
    }

    #[test]
    fn interface_association_defines_function() {
        let bytes = config_bytes(&[
            CONFIG_HEADER,
            &[8, 0x0b, 0, 2, 0x02, 0x02, 0x01, 0], // interfaces 0..2 are one CDC function
            &[9, 4, 0, 0, 0, 0x02, 0x02, 0x01, 0],
            &[9, 4, 1, 0, 1, 0x0a, 0, 0, 0],
            &[7, 5, 0x83, 0x02, 64, 0, 0],
        ]);
        let config = Configuration::parse(&bytes).unwrap();
        assert_eq!(config.functions().len(), 1);
        let function = &config.functions()[0];
        assert_eq!(function.first_interface(), 0);
        assert_eq!(function.interface_count(), 2);
        assert_eq!(function.class_codes().class(), 0x02);
        assert_eq!(config.interfaces().len(), 2);
    }

    #[test]
    fn skips_class_specific_records() {
        let bytes = config_bytes(&[
            CONFIG_HEADER,
            &[9, 4, 0, 0, 1, 0x03, 0, 0, 0],
            &[9, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3f, 0x00], // HID descriptor
            &[7, 5, 0x81, 0x03, 8, 0, 10],
        ]);
        let config = Configuration::parse(&bytes).unwrap();
        let alt = config.interface(0).unwrap().alternate(0).unwrap().clone();
        assert_eq!(alt.endpoints().len(), 1);
        assert_eq!(alt.endpoints()[0].transfer_type(), TransferType::Interrupt);
    }

    #[test]
    fn parses_device_descriptor() {
        let bytes = [
            18, 1, 0x10, 0x02, 0xef, 0x02, 0x01, 64, 0x34, 0x12, 0x78, 0x56, 0x21, 0x43, 1, 2, 3,
            1,
        ];
        let descriptor = DeviceDescriptor::parse(&bytes).unwrap();
        assert_eq!(descriptor.usb_version().major(), 2);
        assert_eq!(descriptor.usb_version().minor(), 1);
        assert_eq!(descriptor.vendor_id(), 0x1234);
        assert_eq!(descriptor.product_id(), 0x5678);
        assert_eq!(descriptor.device_version().major(), 43);
        assert_eq!(descriptor.device_version().minor(), 2);
        assert_eq!(descriptor.device_version().subminor(), 1);
        assert_eq!(descriptor.class_codes().class(), 0xef);
        assert_eq!(descriptor.manufacturer_index(), 1);
        assert_eq!(descriptor.num_configurations(), 1);

        assert!(DeviceDescriptor::parse(&bytes[..17]).is_err());
    }

    #[test]
    fn decodes_string_descriptors() {
        // "USB" with a trailing NUL unit that must be trimmed
        let bytes = [10, 3, b'U', 0, b'S', 0, b'B', 0, 0, 0];
        assert_eq!(parse_string_descriptor(&bytes).unwrap(), "USB");

        // unpaired surrogate decodes lossily instead of failing
        let bad = [6, 3, 0x41, 0x00, 0x00, 0xd8];
        let decoded = parse_string_descriptor(&bad).unwrap();
        assert!(decoded.starts_with('A'));

        assert!(parse_string_descriptor(&[2, 4]).is_err());
        assert!(parse_string_descriptor(&[1]).is_err());
    }
}

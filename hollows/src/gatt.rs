//! The wireless attribute layout.
//!
//! The protocol stack below the attribute layer is an external
//! collaborator; it consumes this declarative description of the services,
//! the advertising payload and the pairing requirements, and calls back
//! into the runtime (`Runtime::radio_write` and friends) for the live
//! characteristics.

use bitflags::bitflags;

// Device Information service.
pub const UUID_SVC_DEVICE_INFO: u16 = 0x180a;
pub const UUID_CHR_MANUFACTURER_NAME: u16 = 0x2a29;
pub const UUID_CHR_MODEL_NUMBER: u16 = 0x2a24;
pub const UUID_CHR_FIRMWARE_REVISION: u16 = 0x2a26;
pub const UUID_CHR_PNP_ID: u16 = 0x2a50;

// Battery service.
pub const UUID_SVC_BATTERY: u16 = 0x180f;
pub const UUID_CHR_BATTERY_LEVEL: u16 = 0x2a19;
pub const UUID_DSC_PRESENTATION_FORMAT: u16 = 0x2904;

// Firefly Serial Protocol.
pub const UUID_SVC_FSP: u16 = 0xabf0;
pub const UUID_CHR_FSP_CONTENT: u16 = 0xabf1;
pub const UUID_CHR_FSP_LOGGER: u16 = 0xabf2;

pub const MANUFACTURER_NAME: &str = "Firefly";

// SIG membership pending...
pub const VENDOR_ID: u16 = 0x5432;
pub const PRODUCT_ID: u16 = 0x0001;
pub const PRODUCT_VERSION: u16 = 0x0006;

/// The battery gauge is not wired up; the level reads a constant.
pub const BATTERY_LEVEL_PERCENT: u8 = 100;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ChrFlags: u16 {
        const READ        = 1 << 0;
        const WRITE       = 1 << 1;
        const NOTIFY      = 1 << 2;
        const INDICATE    = 1 << 3;
        const READ_ENC    = 1 << 4;
        const WRITE_ENC   = 1 << 5;
    }
}

/// What a characteristic serves.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ChrValue {
    /// Fixed bytes captured at registration.
    Static(Vec<u8>),
    /// The constant battery level.
    BatteryLevel,
    /// Framed protocol content; writes land in `Runtime::radio_write`,
    /// reads are empty (the device only indicates).
    Content,
    /// Log line broadcasts.
    Logger,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DescriptorDef {
    pub uuid: u16,
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CharacteristicDef {
    pub uuid: u16,
    pub flags: ChrFlags,
    pub value: ChrValue,
    pub descriptors: Vec<DescriptorDef>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ServiceDef {
    pub uuid: u16,
    pub characteristics: Vec<CharacteristicDef>,
}

/// The PnP ID payload: SIG vendor-id source, then vendor, product and
/// version, little-endian.
pub fn pnp_id() -> [u8; 7] {
    let [vendor_lo, vendor_hi] = VENDOR_ID.to_le_bytes();
    let [product_lo, product_hi] = PRODUCT_ID.to_le_bytes();
    let [version_lo, version_hi] = PRODUCT_VERSION.to_le_bytes();
    [
        0x01, // Bluetooth SIG namespace
        vendor_lo, vendor_hi, product_lo, product_hi, version_lo, version_hi,
    ]
}

/// The standard characteristic presentation descriptor for the battery
/// level: uint8, exponent 0, unit percentage.
pub fn battery_presentation() -> [u8; 7] {
    [
        0x04, // format: uint8
        0x00, // exponent
        0xad, 0x27, // unit: percentage, little-endian
        0x01, // namespace: Bluetooth SIG
        0x00, 0x00, // description
    ]
}

/// Firmware revision string served by the Device Information service.
pub fn firmware_revision() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}

/// The full service table for registration.
pub fn services(model_name: &str) -> Vec<ServiceDef> {
    vec![
        ServiceDef {
            uuid: UUID_SVC_DEVICE_INFO,
            characteristics: vec![
                CharacteristicDef {
                    uuid: UUID_CHR_MANUFACTURER_NAME,
                    flags: ChrFlags::READ,
                    value: ChrValue::Static(MANUFACTURER_NAME.as_bytes().to_vec()),
                    descriptors: Vec::new(),
                },
                CharacteristicDef {
                    uuid: UUID_CHR_MODEL_NUMBER,
                    flags: ChrFlags::READ,
                    value: ChrValue::Static(model_name.as_bytes().to_vec()),
                    descriptors: Vec::new(),
                },
                CharacteristicDef {
                    uuid: UUID_CHR_FIRMWARE_REVISION,
                    flags: ChrFlags::READ,
                    value: ChrValue::Static(firmware_revision().into_bytes()),
                    descriptors: Vec::new(),
                },
                CharacteristicDef {
                    uuid: UUID_CHR_PNP_ID,
                    flags: ChrFlags::READ,
                    value: ChrValue::Static(pnp_id().to_vec()),
                    descriptors: Vec::new(),
                },
            ],
        },
        ServiceDef {
            uuid: UUID_SVC_BATTERY,
            characteristics: vec![CharacteristicDef {
                uuid: UUID_CHR_BATTERY_LEVEL,
                flags: ChrFlags::READ | ChrFlags::NOTIFY,
                value: ChrValue::BatteryLevel,
                descriptors: vec![DescriptorDef {
                    uuid: UUID_DSC_PRESENTATION_FORMAT,
                    value: battery_presentation().to_vec(),
                }],
            }],
        },
        ServiceDef {
            uuid: UUID_SVC_FSP,
            characteristics: vec![
                CharacteristicDef {
                    uuid: UUID_CHR_FSP_CONTENT,
                    flags: ChrFlags::READ
                        | ChrFlags::READ_ENC
                        | ChrFlags::WRITE
                        | ChrFlags::WRITE_ENC
                        | ChrFlags::INDICATE,
                    value: ChrValue::Content,
                    descriptors: Vec::new(),
                },
                CharacteristicDef {
                    uuid: UUID_CHR_FSP_LOGGER,
                    flags: ChrFlags::NOTIFY,
                    value: ChrValue::Logger,
                    descriptors: Vec::new(),
                },
            ],
        },
    ]
}

/// Advertising payload: general-discoverable, BLE only, named, carrying
/// the protocol service UUID.  Re-advertised after every disconnect.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Advertising {
    pub general_discoverable: bool,
    pub bredr_unsupported: bool,
    pub include_tx_power: bool,
    pub name: String,
    pub service_uuid16: u16,
}

pub fn advertising(name: &str) -> Advertising {
    Advertising {
        general_discoverable: true,
        bredr_unsupported: true,
        include_tx_power: true,
        name: name.into(),
        service_uuid16: UUID_SVC_FSP,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoCapability {
    NoInputNoOutput,
    DisplayOnly,
    KeyboardOnly,
}

/// Security-manager settings: bonded, MITM-protected, secure connections,
/// no usable IO for pairing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Pairing {
    pub bonding: bool,
    pub mitm: bool,
    pub secure_connections: bool,
    pub io_capability: IoCapability,
}

pub fn pairing() -> Pairing {
    Pairing {
        bonding: true,
        mitm: true,
        secure_connections: true,
        io_capability: IoCapability::NoInputNoOutput,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pnp_payload_bytes() {
        assert_eq!(pnp_id(), [0x01, 0x32, 0x54, 0x01, 0x00, 0x06, 0x00]);
    }

    #[test]
    fn battery_descriptor_bytes() {
        assert_eq!(
            battery_presentation(),
            [0x04, 0x00, 0xad, 0x27, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn service_table_shape() {
        let services = services("Firefly Pixie (DevKit rev.2)");
        assert_eq!(services.len(), 3);

        let uuids: Vec<u16> = services.iter().map(|s| s.uuid).collect();
        assert_eq!(uuids, [UUID_SVC_DEVICE_INFO, UUID_SVC_BATTERY, UUID_SVC_FSP]);

        let fsp = &services[2];
        let content = &fsp.characteristics[0];
        assert_eq!(content.uuid, UUID_CHR_FSP_CONTENT);
        assert!(content.flags.contains(ChrFlags::WRITE_ENC | ChrFlags::INDICATE));
        assert_eq!(content.value, ChrValue::Content);

        let logger = &fsp.characteristics[1];
        assert_eq!(logger.uuid, UUID_CHR_FSP_LOGGER);
        assert_eq!(logger.flags, ChrFlags::NOTIFY);
    }

    #[test]
    fn advertising_and_pairing_defaults() {
        let adv = advertising("Hollows");
        assert!(adv.general_discoverable && adv.bredr_unsupported);
        assert_eq!(adv.service_uuid16, UUID_SVC_FSP);

        let pairing = pairing();
        assert!(pairing.bonding && pairing.mitm && pairing.secure_connections);
        assert_eq!(pairing.io_capability, IoCapability::NoInputNoOutput);
    }
}

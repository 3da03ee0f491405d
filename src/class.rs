// Copyright (C) 2021-2024 The Aero Project Developers.
//
// This file is part of The Aero Project.
//
// Aero is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Aero is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Aero. If not, see <https://www.gnu.org/licenses/>.

/// Device category decoded from the base-class and subclass bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Unknown,

    ScsiBusController,
    IdeController,
    RaidController,
    AtaController,
    SataController,
    NvmeController,
    OtherMassStorageController,

    EthernetController,
    OtherNetworkController,

    VgaCompatibleController,
    OtherDisplayController,

    AudioDevice,
    OtherMultimediaDevice,

    RamController,
    OtherMemoryController,

    HostBridge,
    IsaBridge,
    PciPciBridge,
    CardBusBridge,
    OtherBridgeDevice,

    SerialController,
    OtherCommunicationsDevice,

    InterruptController,
    DmaController,
    SystemTimer,
    RtcController,
    SdHostController,
    OtherSystemPeripheral,

    UsbController,
    SmBusController,
    OtherSerialBusController,

    EncryptionController,
    SignalProcessingController,
}

impl DeviceType {
    pub fn new(base_class: u8, sub_class: u8) -> Self {
        match (base_class, sub_class) {
            (0x01, 0x00) => DeviceType::ScsiBusController,
            (0x01, 0x01) => DeviceType::IdeController,
            (0x01, 0x04) => DeviceType::RaidController,
            (0x01, 0x05) => DeviceType::AtaController,
            (0x01, 0x06) => DeviceType::SataController,
            (0x01, 0x08) => DeviceType::NvmeController,
            (0x01, _) => DeviceType::OtherMassStorageController,

            (0x02, 0x00) => DeviceType::EthernetController,
            (0x02, _) => DeviceType::OtherNetworkController,

            (0x03, 0x00) => DeviceType::VgaCompatibleController,
            (0x03, _) => DeviceType::OtherDisplayController,

            (0x04, 0x01) | (0x04, 0x03) => DeviceType::AudioDevice,
            (0x04, _) => DeviceType::OtherMultimediaDevice,

            (0x05, 0x00) => DeviceType::RamController,
            (0x05, _) => DeviceType::OtherMemoryController,

            (0x06, 0x00) => DeviceType::HostBridge,
            (0x06, 0x01) => DeviceType::IsaBridge,
            (0x06, 0x04) => DeviceType::PciPciBridge,
            (0x06, 0x07) => DeviceType::CardBusBridge,
            (0x06, _) => DeviceType::OtherBridgeDevice,

            (0x07, 0x00) => DeviceType::SerialController,
            (0x07, _) => DeviceType::OtherCommunicationsDevice,

            (0x08, 0x00) => DeviceType::InterruptController,
            (0x08, 0x01) => DeviceType::DmaController,
            (0x08, 0x02) => DeviceType::SystemTimer,
            (0x08, 0x03) => DeviceType::RtcController,
            (0x08, 0x05) => DeviceType::SdHostController,
            (0x08, _) => DeviceType::OtherSystemPeripheral,

            (0x0c, 0x03) => DeviceType::UsbController,
            (0x0c, 0x05) => DeviceType::SmBusController,
            (0x0c, _) => DeviceType::OtherSerialBusController,

            (0x10, _) => DeviceType::EncryptionController,
            (0x11, _) => DeviceType::SignalProcessingController,

            _ => DeviceType::Unknown,
        }
    }
}

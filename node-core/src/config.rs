//! Node configuration and its persisted form.

use crate::codec::telegram::{DeviceType, SHADER_CHANNELS, ShaderSetup, VERSION_LEN};
use crate::confirm::{ClientTable, ConfirmConfig, DEFAULT_MAX_RETRY, EMPTY_CLIENT};
use crate::persist::{
    ADDRESS_OFFSET, CLIENTS_OFFSET, DEVICE_TYPE_OFFSET, RETRIES_OFFSET, SHADER_SETUP_OFFSET,
    Storage,
};
use crate::pwm::FadeConfig;
use crate::shader::ShaderTiming;

/// Address used until the head-end assigns one.
pub const DEFAULT_NODE_ADDRESS: u8 = 0xFE;

/// Version string returned by info requests.
pub const FIRMWARE_VERSION: [u8; VERSION_LEN] = *b"homebus-node 0.1";

const SETUP_RECORD_LEN: u16 = 6;

/// Everything a node needs to know about itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeConfig {
    pub address: u8,
    pub device_type: DeviceType,
    pub clients: ClientTable,
    pub shader_setup: [ShaderSetup; SHADER_CHANNELS],
    pub shader_timing: ShaderTiming,
    pub fade: FadeConfig,
    pub confirm: ConfirmConfig,
}

impl NodeConfig {
    /// Fresh configuration for a node of `device_type` at `address`.
    #[must_use]
    pub fn new(address: u8, device_type: DeviceType) -> Self {
        Self {
            address,
            device_type,
            clients: ClientTable::EMPTY,
            shader_setup: [ShaderSetup::UNCONFIGURED; SHADER_CHANNELS],
            shader_timing: ShaderTiming::default(),
            fade: FadeConfig::default(),
            confirm: ConfirmConfig::for_address(address),
        }
    }

    /// Reads the persisted configuration.
    ///
    /// Erased cells fall back to defaults; `device_type` applies when the
    /// stored type is unknown.
    pub fn load<S: Storage>(storage: &S, device_type: DeviceType) -> Self {
        let address = match storage.read(ADDRESS_OFFSET) {
            EMPTY_CLIENT => DEFAULT_NODE_ADDRESS,
            stored => stored,
        };
        let device_type =
            DeviceType::from_raw(storage.read(DEVICE_TYPE_OFFSET)).unwrap_or(device_type);

        let mut config = Self::new(address, device_type);
        storage.read_into(CLIENTS_OFFSET, &mut config.clients.addresses);
        storage.read_into(RETRIES_OFFSET, &mut config.clients.retries);
        for retries in &mut config.clients.retries {
            if *retries == 0xFF {
                *retries = DEFAULT_MAX_RETRY;
            }
        }

        for (setup, base) in config
            .shader_setup
            .iter_mut()
            .zip((SHADER_SETUP_OFFSET..).step_by(usize::from(SETUP_RECORD_LEN)))
        {
            let mut raw = [0u8; 6];
            storage.read_into(base, &mut raw);
            *setup = ShaderSetup {
                power: raw[0],
                direction: raw[1],
                open_ds: u16::from_le_bytes([raw[2], raw[3]]),
                close_ds: u16::from_le_bytes([raw[4], raw[5]]),
            };
        }
        config
    }

    /// Writes every persisted field.
    pub fn store<S: Storage>(&self, storage: &mut S) {
        self.store_address(storage);
        storage.write(DEVICE_TYPE_OFFSET, self.device_type.to_raw());
        self.store_clients(storage);
        for channel in 0..SHADER_CHANNELS {
            self.store_shader_setup(storage, channel);
        }
    }

    pub fn store_address<S: Storage>(&self, storage: &mut S) {
        storage.write(ADDRESS_OFFSET, self.address);
    }

    pub fn store_clients<S: Storage>(&self, storage: &mut S) {
        storage.write_all(CLIENTS_OFFSET, &self.clients.addresses);
        storage.write_all(RETRIES_OFFSET, &self.clients.retries);
    }

    pub fn store_shader_setup<S: Storage>(&self, storage: &mut S, channel: usize) {
        let Some(setup) = self.shader_setup.get(channel) else {
            return;
        };
        let index = u16::try_from(channel).unwrap_or(0);
        let mut raw = [0u8; 6];
        raw[0] = setup.power;
        raw[1] = setup.direction;
        raw[2..4].copy_from_slice(&setup.open_ds.to_le_bytes());
        raw[4..6].copy_from_slice(&setup.close_ds.to_le_bytes());
        storage.write_all(SHADER_SETUP_OFFSET + index * SETUP_RECORD_LEN, &raw);
    }

    /// Changes the node address and the timing derived from it.
    pub fn set_address(&mut self, address: u8) {
        self.address = address;
        self.confirm.collision_window_ms = ConfirmConfig::collision_window_for(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::RamStorage;

    #[test]
    fn erased_storage_yields_defaults() {
        let storage = RamStorage::<0x400>::new();
        let config = NodeConfig::load(&storage, DeviceType::PwmPanel);
        assert_eq!(config.address, DEFAULT_NODE_ADDRESS);
        assert_eq!(config.device_type, DeviceType::PwmPanel);
        assert!(config.clients.is_empty());
        assert_eq!(config.clients.retries[0], DEFAULT_MAX_RETRY);
        assert!(!config.shader_setup[0].is_configured());
    }

    #[test]
    fn stored_configuration_reloads() {
        let mut storage = RamStorage::<0x400>::new();
        let mut config = NodeConfig::new(0x21, DeviceType::ShaderPanel);
        config.clients.addresses[0] = 0x30;
        config.clients.retries[0] = 5;
        config.shader_setup[14] = ShaderSetup {
            power: 4,
            direction: 5,
            open_ds: 300,
            close_ds: 250,
        };
        config.store(&mut storage);

        assert_eq!(NodeConfig::load(&storage, DeviceType::SwitchPanel), config);
    }
}

//! Device registry contract and the whole-document edits behind it.

use crate::domain::error::RemoteError;
use crate::domain::models::{
    DeviceId, KeyMapping, LearnedCommand, MappingMode, RemoteDevice,
};
use crate::domain::settings::{GlobalSettings, RemoteConfig};
use async_trait::async_trait;

impl RemoteConfig {
    pub fn active_device(&self) -> Option<&RemoteDevice> {
        self.devices.iter().find(|device| device.active)
    }

    pub fn device(&self, id: &DeviceId) -> Option<&RemoteDevice> {
        self.devices.iter().find(|device| &device.id == id)
    }

    fn device_mut(&mut self, id: &DeviceId) -> Result<&mut RemoteDevice, RemoteError> {
        self.devices
            .iter_mut()
            .find(|device| &device.id == id)
            .ok_or_else(|| RemoteError::UnknownDevice(id.to_string()))
    }

    /// Keep at most one active device (the first one flagged wins).
    pub fn normalize(&mut self) {
        let mut seen_active = false;
        for device in &mut self.devices {
            if device.active {
                if seen_active {
                    device.active = false;
                }
                seen_active = true;
            }
        }
        self.settings = self.settings.clone().sanitized();
    }

    /// Adds a remote, or refreshes the name of one already paired. The first
    /// remote ever added becomes active.
    pub fn add_device(&mut self, mut device: RemoteDevice) {
        if let Some(existing) = self.devices.iter_mut().find(|d| d.id == device.id) {
            existing.name = device.name;
            return;
        }

        let make_active = device.active || self.active_device().is_none();
        device.active = false;
        let id = device.id.clone();
        self.devices.push(device);
        if make_active {
            self.activate(&id);
        }
    }

    /// Removes a remote. When the active one goes, the first remaining
    /// remote (original order) takes over.
    pub fn remove_device(&mut self, id: &DeviceId) -> Result<RemoteDevice, RemoteError> {
        let index = self
            .devices
            .iter()
            .position(|device| &device.id == id)
            .ok_or_else(|| RemoteError::UnknownDevice(id.to_string()))?;
        let removed = self.devices.remove(index);
        if removed.active {
            if let Some(first) = self.devices.first_mut() {
                first.active = true;
            }
        }
        Ok(removed)
    }

    pub fn set_active(&mut self, id: &DeviceId) -> Result<(), RemoteError> {
        self.device_mut(id)?;
        self.activate(id);
        Ok(())
    }

    fn activate(&mut self, id: &DeviceId) {
        for device in &mut self.devices {
            device.active = &device.id == id;
        }
    }

    pub fn update_key_mapping(
        &mut self,
        id: &DeviceId,
        mapping: KeyMapping,
    ) -> Result<(), RemoteError> {
        self.device_mut(id)?.key_mapping = mapping;
        Ok(())
    }

    pub fn set_mapping_mode(&mut self, id: &DeviceId, mode: MappingMode) -> Result<(), RemoteError> {
        self.device_mut(id)?.mapping_mode = mode;
        Ok(())
    }

    /// Replaces a device's learned commands. Later entries win when two share
    /// the same (command, press) pair.
    pub fn update_learned_commands(
        &mut self,
        id: &DeviceId,
        commands: Vec<LearnedCommand>,
    ) -> Result<(), RemoteError> {
        let mut unique: Vec<LearnedCommand> = Vec::with_capacity(commands.len());
        for learned in commands {
            match unique
                .iter_mut()
                .find(|existing| existing.command == learned.command && existing.press == learned.press)
            {
                Some(existing) => existing.action = learned.action,
                None => unique.push(learned),
            }
        }
        self.device_mut(id)?.learned_commands = unique;
        Ok(())
    }
}

/// Persistent store of configured remotes and global settings.
///
/// Every write rewrites the whole document (last writer wins).
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn load(&self) -> Result<RemoteConfig, RemoteError>;

    async fn store(&self, config: &RemoteConfig) -> Result<(), RemoteError>;

    async fn add_device(&self, device: RemoteDevice) -> Result<RemoteConfig, RemoteError> {
        let mut config = self.load().await?;
        config.add_device(device);
        self.store(&config).await?;
        Ok(config)
    }

    async fn remove_device(&self, id: &DeviceId) -> Result<RemoteConfig, RemoteError> {
        let mut config = self.load().await?;
        config.remove_device(id)?;
        self.store(&config).await?;
        Ok(config)
    }

    async fn set_active(&self, id: &DeviceId) -> Result<RemoteConfig, RemoteError> {
        let mut config = self.load().await?;
        config.set_active(id)?;
        self.store(&config).await?;
        Ok(config)
    }

    async fn update_key_mapping(
        &self,
        id: &DeviceId,
        mapping: KeyMapping,
    ) -> Result<RemoteConfig, RemoteError> {
        let mut config = self.load().await?;
        config.update_key_mapping(id, mapping)?;
        self.store(&config).await?;
        Ok(config)
    }

    async fn set_mapping_mode(
        &self,
        id: &DeviceId,
        mode: MappingMode,
    ) -> Result<RemoteConfig, RemoteError> {
        let mut config = self.load().await?;
        config.set_mapping_mode(id, mode)?;
        self.store(&config).await?;
        Ok(config)
    }

    async fn update_learned_commands(
        &self,
        id: &DeviceId,
        commands: Vec<LearnedCommand>,
    ) -> Result<RemoteConfig, RemoteError> {
        let mut config = self.load().await?;
        config.update_learned_commands(id, commands)?;
        self.store(&config).await?;
        Ok(config)
    }

    async fn update_settings(&self, settings: GlobalSettings) -> Result<RemoteConfig, RemoteError> {
        let mut config = self.load().await?;
        config.settings = settings.sanitized();
        self.store(&config).await?;
        Ok(config)
    }
}

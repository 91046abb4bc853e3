use pnet::datalink::{self, NetworkInterface};
use std::net::IpAddr;

use crate::error::{MonitorError, Result};

pub struct InterfaceManager {
    interface: NetworkInterface,
}

impl InterfaceManager {
    pub fn new(name: &str) -> Result<Self> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or_else(|| MonitorError::Interface(format!("Interface {} not found", name)))?;

        Ok(Self { interface })
    }

    pub fn get_interface(&self) -> &NetworkInterface {
        &self.interface
    }

    /// 接口上配置的本机地址
    pub fn local_addresses(&self) -> Vec<IpAddr> {
        self.interface.ips.iter().map(|net| net.ip()).collect()
    }

    pub fn is_up(&self) -> bool {
        self.interface.is_up()
    }
}

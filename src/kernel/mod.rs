//! Abstract interface to the host packet-processing layer. The protocol
//! engine only ever emits commands against this trait; platform
//! backends (XFRM or otherwise) live behind it. The default backend
//! logs what it would do, and the mock records commands for tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::crypto::SymKey;
use crate::ike::ts::TrafficSelector;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("netlink error: {0}")]
    Netlink(String),
    #[error("no such SA: {0}")]
    NoSuchSa(String),
    #[error("interface error: {0}")]
    Interface(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaProto {
    Esp,
    Ah,
}

impl std::fmt::Display for SaProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaProto::Esp => f.write_str("esp"),
            SaProto::Ah => f.write_str("ah"),
        }
    }
}

/// Identifier of a kernel SA: protocol, SPI and destination, formatted
/// the traditional way (`esp.89abcdef@203.0.113.5`). Formatting cannot
/// truncate; the Display impl builds the whole string or nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaId {
    pub proto: SaProto,
    pub spi: u32,
    pub dst: IpAddr,
}

impl std::fmt::Display for SaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:08x}@{}", self.proto, self.spi, self.dst)
    }
}

/// Everything the kernel needs to install one direction of a child SA.
pub struct SaInstall {
    pub said: SaId,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub encr_key: SymKey,
    pub ts_src: TrafficSelector,
    pub ts_dst: TrafficSelector,
    pub inbound: bool,
    pub if_id: Option<u32>,
    pub lifetime: Duration,
}

impl std::fmt::Debug for SaInstall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaInstall")
            .field("said", &self.said.to_string())
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("inbound", &self.inbound)
            .field("if_id", &self.if_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait KernelInterface: Send + Sync {
    async fn install_sa(&self, sa: SaInstall) -> Result<(), KernelError>;
    async fn delete_sa(&self, said: SaId) -> Result<(), KernelError>;
    /// Age of the most recent inbound traffic on the SA, when known.
    async fn get_sa_info(&self, said: SaId) -> Result<Option<Duration>, KernelError>;
    async fn create_virtual_interface(
        &self,
        name: &str,
        outer_device: &str,
        if_id: u32,
    ) -> Result<(), KernelError>;
    async fn set_interface_up(&self, name: &str) -> Result<(), KernelError>;
    async fn delete_interface(&self, name: &str) -> Result<(), KernelError>;
    /// Expire orphaned holds left behind by failed negotiations.
    async fn expire_bare_shunts(&self) -> Result<(), KernelError>;
}

/// Backend of last resort: logs every command. Used when no platform
/// backend is configured, and handy under test harnesses that only care
/// about the protocol side.
#[derive(Debug, Default)]
pub struct NullKernel;

#[async_trait]
impl KernelInterface for NullKernel {
    async fn install_sa(&self, sa: SaInstall) -> Result<(), KernelError> {
        tracing::info!("kernel: install {} ({})", sa.said, if sa.inbound { "in" } else { "out" });
        Ok(())
    }

    async fn delete_sa(&self, said: SaId) -> Result<(), KernelError> {
        tracing::info!("kernel: delete {}", said);
        Ok(())
    }

    async fn get_sa_info(&self, _said: SaId) -> Result<Option<Duration>, KernelError> {
        Ok(None)
    }

    async fn create_virtual_interface(
        &self,
        name: &str,
        outer_device: &str,
        if_id: u32,
    ) -> Result<(), KernelError> {
        tracing::info!("kernel: create interface {} on {} if_id {}", name, outer_device, if_id);
        Ok(())
    }

    async fn set_interface_up(&self, name: &str) -> Result<(), KernelError> {
        tracing::info!("kernel: set {} up", name);
        Ok(())
    }

    async fn delete_interface(&self, name: &str) -> Result<(), KernelError> {
        tracing::info!("kernel: delete interface {}", name);
        Ok(())
    }

    async fn expire_bare_shunts(&self) -> Result<(), KernelError> {
        tracing::debug!("kernel: expire bare shunts");
        Ok(())
    }
}

/// Recording backend for tests: keeps installed SAs, serves canned
/// `get_sa_info` ages, counts shunt sweeps.
#[derive(Debug, Default)]
pub struct MockKernel {
    pub installed: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub interfaces: Mutex<Vec<String>>,
    pub ages: Mutex<HashMap<String, Duration>>,
    pub shunt_sweeps: Mutex<u32>,
}

impl MockKernel {
    pub fn set_age(&self, said: SaId, age: Duration) {
        self.ages.lock().unwrap().insert(said.to_string(), age);
    }
}

#[async_trait]
impl KernelInterface for MockKernel {
    async fn install_sa(&self, sa: SaInstall) -> Result<(), KernelError> {
        self.installed.lock().unwrap().push(sa.said.to_string());
        Ok(())
    }

    async fn delete_sa(&self, said: SaId) -> Result<(), KernelError> {
        self.deleted.lock().unwrap().push(said.to_string());
        Ok(())
    }

    async fn get_sa_info(&self, said: SaId) -> Result<Option<Duration>, KernelError> {
        Ok(self.ages.lock().unwrap().get(&said.to_string()).copied())
    }

    async fn create_virtual_interface(
        &self,
        name: &str,
        _outer_device: &str,
        if_id: u32,
    ) -> Result<(), KernelError> {
        self.interfaces
            .lock()
            .unwrap()
            .push(format!("{}:{}", name, if_id));
        Ok(())
    }

    async fn set_interface_up(&self, _name: &str) -> Result<(), KernelError> {
        Ok(())
    }

    async fn delete_interface(&self, name: &str) -> Result<(), KernelError> {
        self.interfaces.lock().unwrap().retain(|i| !i.starts_with(name));
        Ok(())
    }

    async fn expire_bare_shunts(&self) -> Result<(), KernelError> {
        *self.shunt_sweeps.lock().unwrap() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn said_formats_protocol_hex_spi_and_destination() {
        let said = SaId {
            proto: SaProto::Esp,
            spi: 0x89ab_cdef,
            dst: "203.0.113.5".parse().unwrap(),
        };
        assert_eq!(said.to_string(), "esp.89abcdef@203.0.113.5");

        let v6 = SaId {
            proto: SaProto::Ah,
            spi: 0x1,
            dst: "2001:db8::1".parse().unwrap(),
        };
        assert_eq!(v6.to_string(), "ah.00000001@2001:db8::1");
    }

    #[tokio::test]
    async fn mock_kernel_records_commands() {
        let kernel = MockKernel::default();
        let said = SaId {
            proto: SaProto::Esp,
            spi: 7,
            dst: "192.0.2.9".parse().unwrap(),
        };
        kernel.set_age(said, Duration::from_secs(12));
        assert_eq!(
            kernel.get_sa_info(said).await.unwrap(),
            Some(Duration::from_secs(12))
        );

        kernel.delete_sa(said).await.unwrap();
        assert_eq!(kernel.deleted.lock().unwrap().len(), 1);

        kernel.expire_bare_shunts().await.unwrap();
        assert_eq!(*kernel.shunt_sweeps.lock().unwrap(), 1);
    }
}

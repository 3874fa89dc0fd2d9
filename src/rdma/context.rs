use std::sync::Arc;
use std::{fmt, io};

use super::gid::Gid;
use super::qp::Mtu;
use super::type_alias::*;
use crate::provider::{DeviceAttr, LinkLayer, PortAttr, Provider};

struct ContextInner {
    provider: Arc<dyn Provider>,
    dev_attr: DeviceAttr,
    port_attr: PortAttr,
    port_num: PortNum,
    gid_index: GidIndex,
}

impl fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("dev", &self.provider.name())
            .field("port_num", &self.port_num)
            .field("gid", &self.port_attr.gid)
            .finish()
    }
}

/// Device context.
///
/// This type is a simple wrapper of an `Arc` and is guaranteed to have the
/// same memory layout with it.
///
/// Rather than a bare device, a context is bound to one port and one GID
/// index of it; to operate on different ports of the same device, create
/// multiple `Context` instances. Every other resource keeps its context alive,
/// so teardown happens in reverse creation order no matter the drop order.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Bind an opened device to a port and GID index, querying the device and
    /// port attributes.
    ///
    /// Fails if the port does not exist, is not active, or has no GID at
    /// `gid_index`.
    pub fn new(provider: Arc<dyn Provider>, port_num: PortNum, gid_index: GidIndex) -> io::Result<Self> {
        let dev_attr = provider.query_device()?;
        if port_num == 0 || port_num > dev_attr.phys_port_cnt {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid port number {}", port_num),
            ));
        }

        let port_attr = provider.query_port(port_num, gid_index)?;
        if !port_attr.active {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("port {} is not active", port_num),
            ));
        }

        log::debug!(
            "opened {} port {} (lid {}, gid[{}] {})",
            provider.name(),
            port_num,
            port_attr.lid,
            gid_index,
            port_attr.gid
        );
        Ok(Context {
            inner: Arc::new(ContextInner {
                provider,
                dev_attr,
                port_attr,
                port_num,
                gid_index,
            }),
        })
    }

    /// Open a libibverbs device and bind it to a port and GID index.
    ///
    /// If `dev_name` is `None`, the first device found is used. Otherwise, the
    /// first device whose name matches the regular expression is used.
    #[cfg(feature = "ibverbs")]
    pub fn open(dev_name: Option<&str>, port_num: PortNum, gid_index: GidIndex) -> io::Result<Self> {
        let dev = crate::provider::verbs::VerbsDevice::open(dev_name)?;
        Self::new(Arc::new(dev), port_num, gid_index)
    }

    /// Get the provider of the underlying device.
    #[inline]
    pub fn provider(&self) -> &dyn Provider {
        self.inner.provider.as_ref()
    }

    /// Get the device attributes.
    #[inline]
    pub fn attr(&self) -> &DeviceAttr {
        &self.inner.dev_attr
    }

    /// Get the LID of the bound port.
    #[inline]
    pub fn lid(&self) -> Lid {
        self.inner.port_attr.lid
    }

    /// Get the port number passed by the user when opening this context.
    #[inline]
    pub fn port_num(&self) -> PortNum {
        self.inner.port_num
    }

    /// Get the GID at the bound GID index.
    #[inline]
    pub fn gid(&self) -> Gid {
        self.inner.port_attr.gid
    }

    /// Get the GID index passed by the user when opening this context.
    #[inline]
    pub fn gid_index(&self) -> GidIndex {
        self.inner.gid_index
    }

    /// Get the active MTU of the bound port.
    #[inline]
    pub fn active_mtu(&self) -> Mtu {
        self.inner.port_attr.active_mtu
    }

    /// Get the link layer of the bound port.
    #[inline]
    pub fn link_layer(&self) -> LinkLayer {
        self.inner.port_attr.link_layer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::soft::{SoftDeviceConfig, SoftFabric};

    #[test]
    fn bind_port_and_gid() {
        let fabric = SoftFabric::new();
        let ctx = Context::new(fabric.open_device(), 1, 1).unwrap();
        assert_eq!(ctx.lid(), 1);
        assert_eq!(ctx.gid().raw()[10..12], [0xff, 0xff]);
        assert_eq!(ctx.active_mtu(), Mtu::Mtu4096);
        assert_eq!(ctx.link_layer(), LinkLayer::InfiniBand);
        assert_eq!(ctx.provider().name(), "soft0");
    }

    #[test]
    fn reject_bad_port() {
        let fabric = SoftFabric::new();
        assert!(Context::new(fabric.open_device(), 2, 0).is_err());
        assert!(Context::new(fabric.open_device(), 1, 9).is_err());

        let down = SoftDeviceConfig {
            port_active: false,
            ..Default::default()
        };
        let err = Context::new(fabric.open_device_with(down), 1, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}

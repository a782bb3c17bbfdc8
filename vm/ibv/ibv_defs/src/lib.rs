// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the InfiniBand verbs paravirtualization ports.
//!
//! A guest invokes a verb by writing the guest physical address of a request
//! structure to one of the I/O ports in [`IbvOpcode`]. The structures in this
//! crate are the exact byte layout shared by both sides of that boundary:
//! they are packed, their field order is fixed, and their sizes are checked at
//! compile time. Changing any of them is a protocol break.

#![no_std]
#![forbid(unsafe_code)]

use core::fmt;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Maximum number of device handles returned by `IBV_GET_DEVICE_LIST`.
pub const MAX_NUM_OF_IBV_DEVICES: usize = 16;

/// Size of the guest buffer that receives a device name, including the
/// terminating NUL.
pub const IBV_SYSFS_NAME_MAX: usize = 64;

/// The handle value that denotes "no resource" (a NULL return).
pub const NULL_HANDLE: u64 = 0;

/// Guest-visible errno for a host resource limit.
pub const IBV_ENOMEM: i32 = 12;

/// Guest-visible errno for a guest address outside of guest memory.
pub const IBV_EFAULT: i32 = 14;

/// Guest-visible errno for a handle that does not name a live resource.
pub const IBV_EINVAL: i32 = 22;

/// The I/O ports used to issue verbs calls.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum IbvOpcode {
    /// Records the base of the guest's IB memory pool.
    SetIbPoolAddr = 0x609,
    /// `ibv_open_device`.
    OpenDevice = 0x610,
    /// `ibv_get_device_list`.
    GetDeviceList = 0x611,
    /// `ibv_get_device_name`.
    GetDeviceName = 0x612,
    /// `ibv_query_port`.
    QueryPort = 0x613,
    /// `ibv_create_comp_channel`.
    CreateCompChannel = 0x614,
    /// Emits a line of guest kernel diagnostics on the host.
    KernelIbvLog = 0x615,
}

impl IbvOpcode {
    /// All opcodes, in port order.
    pub const ALL: [Self; 7] = [
        Self::SetIbPoolAddr,
        Self::OpenDevice,
        Self::GetDeviceList,
        Self::GetDeviceName,
        Self::QueryPort,
        Self::CreateCompChannel,
        Self::KernelIbvLog,
    ];

    /// The I/O port number for this opcode.
    pub const fn port(self) -> u16 {
        self as u16
    }

    /// The name used for this port by the guest interface.
    pub const fn name(self) -> &'static str {
        match self {
            Self::SetIbPoolAddr => "SET_IB_POOL_ADDR",
            Self::OpenDevice => "IBV_OPEN_DEVICE",
            Self::GetDeviceList => "IBV_GET_DEVICE_LIST",
            Self::GetDeviceName => "IBV_GET_DEVICE_NAME",
            Self::QueryPort => "IBV_QUERY_PORT",
            Self::CreateCompChannel => "IBV_CREATE_COMP_CHANNEL",
            Self::KernelIbvLog => "KERNEL_IBV_LOG",
        }
    }
}

impl fmt::Display for IbvOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// A port number that is not one of the [`IbvOpcode`] ports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnknownOpcode(pub u16);

impl fmt::Display for UnknownOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown ibv port {:#x}", self.0)
    }
}

impl core::error::Error for UnknownOpcode {}

impl TryFrom<u16> for IbvOpcode {
    type Error = UnknownOpcode;

    fn try_from(port: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|op| op.port() == port)
            .ok_or(UnknownOpcode(port))
    }
}

/// Request for [`IbvOpcode::SetIbPoolAddr`].
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SetIbPoolAddr {
    /// Guest physical address of the pool.
    pub pool_addr: u64,
}

/// Request for [`IbvOpcode::GetDeviceList`].
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GetDeviceList {
    /// Guest address of an `i32` that receives the device count.
    pub num_devices: u64,
    /// Guest address of a `[u64; MAX_NUM_OF_IBV_DEVICES]` handle array.
    /// Cleared to [`NULL_HANDLE`] on failure.
    pub ret: u64,
}

/// Request for [`IbvOpcode::GetDeviceName`].
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GetDeviceName {
    /// Device handle.
    pub device: u64,
    /// Guest address of an [`IBV_SYSFS_NAME_MAX`] byte buffer that receives
    /// the NUL-terminated name. Cleared to [`NULL_HANDLE`] on failure.
    pub ret: u64,
}

/// Request for [`IbvOpcode::OpenDevice`].
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct OpenDevice {
    /// Device handle.
    pub device: u64,
    /// Context handle, or [`NULL_HANDLE`].
    pub ret: u64,
}

/// Request for [`IbvOpcode::QueryPort`].
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueryPort {
    /// Context handle.
    pub context: u64,
    /// Port number, starting at 1.
    pub port_num: u8,
    /// Guest address of a [`PortAttr`].
    pub port_attr: u64,
    /// Native status, 0 on success.
    pub ret: i32,
}

/// Request for [`IbvOpcode::CreateCompChannel`].
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CreateCompChannel {
    /// Context handle.
    pub context: u64,
    /// Completion channel handle, or [`NULL_HANDLE`].
    pub ret: u64,
}

/// `struct ibv_port_attr`.
#[expect(missing_docs)] // field names match the native header
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PortAttr {
    pub state: u32,
    pub max_mtu: u32,
    pub active_mtu: u32,
    pub gid_tbl_len: i32,
    pub port_cap_flags: u32,
    pub max_msg_sz: u32,
    pub bad_pkey_cntr: u32,
    pub qkey_viol_cntr: u32,
    pub pkey_tbl_len: u16,
    pub lid: u16,
    pub sm_lid: u16,
    pub lmc: u8,
    pub max_vl_num: u8,
    pub sm_sl: u8,
    pub subnet_timeout: u8,
    pub init_type_reply: u8,
    pub active_width: u8,
    pub active_speed: u8,
    pub phys_state: u8,
    pub link_layer: u8,
    pub flags: u8,
    pub port_cap_flags2: u16,
    pub reserved: [u8; 2],
}

const _: () = {
    assert!(size_of::<SetIbPoolAddr>() == 8);
    assert!(size_of::<GetDeviceList>() == 16);
    assert!(size_of::<GetDeviceName>() == 16);
    assert!(size_of::<OpenDevice>() == 16);
    assert!(size_of::<QueryPort>() == 21);
    assert!(size_of::<CreateCompChannel>() == 16);
    assert!(size_of::<PortAttr>() == 52);
};

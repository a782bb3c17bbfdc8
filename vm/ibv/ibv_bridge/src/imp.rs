// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Executors for the individual verbs ports.
//!
//! Each executor translates and checks every guest address in its request
//! and resolves every handle before touching the native library, and
//! registers every native object before the guest can see it.

use crate::ratelimit::info_ratelimited;
use crate::ratelimit::warn_ratelimited;
use crate::registry::ResourceKind;
use crate::support::CallError;
use crate::support::IbvCall;
use crate::support::WireRequest;
use crate::IbvSession;
use ibv_defs as defs;
use ibv_defs::IbvOpcode;
use ibv_defs::PortAttr;
use ibv_defs::IBV_SYSFS_NAME_MAX;
use ibv_defs::MAX_NUM_OF_IBV_DEVICES;
use ibv_defs::NULL_HANDLE;
use zerocopy::IntoBytes;

/// An executor: runs the call whose request is at the given guest address.
pub type IbvHandler = fn(&IbvSession, u64) -> Result<(), CallError>;

/// Returns the executor for `opcode`.
pub fn handler(opcode: IbvOpcode) -> IbvHandler {
    match opcode {
        IbvOpcode::SetIbPoolAddr => set_ib_pool_addr,
        IbvOpcode::OpenDevice => open_device,
        IbvOpcode::GetDeviceList => get_device_list,
        IbvOpcode::GetDeviceName => get_device_name,
        IbvOpcode::QueryPort => query_port,
        IbvOpcode::CreateCompChannel => create_comp_channel,
        IbvOpcode::KernelIbvLog => kernel_ibv_log,
    }
}

impl WireRequest for defs::SetIbPoolAddr {
    const OPCODE: IbvOpcode = IbvOpcode::SetIbPoolAddr;

    fn set_failure(&mut self, _err: &CallError) {}
}

impl WireRequest for defs::GetDeviceList {
    const OPCODE: IbvOpcode = IbvOpcode::GetDeviceList;

    fn set_failure(&mut self, _err: &CallError) {
        self.ret = NULL_HANDLE;
    }
}

impl WireRequest for defs::GetDeviceName {
    const OPCODE: IbvOpcode = IbvOpcode::GetDeviceName;

    fn set_failure(&mut self, _err: &CallError) {
        self.ret = NULL_HANDLE;
    }
}

impl WireRequest for defs::OpenDevice {
    const OPCODE: IbvOpcode = IbvOpcode::OpenDevice;

    fn set_failure(&mut self, _err: &CallError) {
        self.ret = NULL_HANDLE;
    }
}

impl WireRequest for defs::QueryPort {
    const OPCODE: IbvOpcode = IbvOpcode::QueryPort;

    fn set_failure(&mut self, err: &CallError) {
        self.ret = -err.errno();
    }
}

impl WireRequest for defs::CreateCompChannel {
    const OPCODE: IbvOpcode = IbvOpcode::CreateCompChannel;

    fn set_failure(&mut self, _err: &CallError) {
        self.ret = NULL_HANDLE;
    }
}

/// `SET_IB_POOL_ADDR`: records the guest's IB memory pool base, once.
pub fn set_ib_pool_addr(session: &IbvSession, gpa: u64) -> Result<(), CallError> {
    IbvCall::<defs::SetIbPoolAddr>::run(session, gpa, |req, _| {
        let pool_addr = req.pool_addr;
        if !session.config().use_ib_mem_pool {
            warn_ratelimited!(
                session.warn_limiter(),
                pool_addr,
                "ib memory pool disabled, ignoring pool address"
            );
            return Ok(());
        }
        session
            .guest_memory()
            .translate(pool_addr, 1)
            .map_err(CallError::OutOfBounds)?;
        if session.set_ib_pool_addr(pool_addr) {
            tracing::debug!(pool_addr, "ib memory pool set");
        } else {
            warn_ratelimited!(
                session.warn_limiter(),
                pool_addr,
                current = ?session.ib_pool_addr(),
                "ib memory pool already set, ignoring"
            );
        }
        Ok(())
    })
}

/// `IBV_GET_DEVICE_LIST`: fills the guest's handle array and count.
///
/// At most [`MAX_NUM_OF_IBV_DEVICES`] devices are reported. When the host
/// has more, the first ones in native order are returned and the count is
/// clamped to match the array.
pub fn get_device_list(session: &IbvSession, gpa: u64) -> Result<(), CallError> {
    IbvCall::<defs::GetDeviceList>::run(session, gpa, |req, output| {
        let gm = session.guest_memory();
        let count_gpa = req.num_devices;
        let list_gpa = req.ret;
        gm.translate(count_gpa, size_of::<i32>())
            .map_err(CallError::OutOfBounds)?;
        gm.translate(list_gpa, size_of::<u64>() * MAX_NUM_OF_IBV_DEVICES)
            .map_err(CallError::OutOfBounds)?;

        let Some(devices) = session.verbs().get_device_list() else {
            req.ret = NULL_HANDLE;
            return output.write_plain(count_gpa, &0i32);
        };

        if devices.len() > MAX_NUM_OF_IBV_DEVICES {
            warn_ratelimited!(
                session.warn_limiter(),
                count = devices.len(),
                max = MAX_NUM_OF_IBV_DEVICES,
                "too many ibv devices, reporting the first ones"
            );
        }
        let handles = devices
            .iter()
            .take(MAX_NUM_OF_IBV_DEVICES)
            .map(|&device| session.register(device, ResourceKind::Device))
            .collect::<Result<Vec<u64>, _>>()?;

        output.write(list_gpa, handles.as_bytes())?;
        output.write_plain(count_gpa, &(handles.len() as i32))
    })
}

/// `IBV_GET_DEVICE_NAME`: copies the device name into the guest buffer
/// whose address the guest placed in `ret`.
///
/// The native string stays owned by the host; the guest receives its own
/// NUL-terminated copy.
pub fn get_device_name(session: &IbvSession, gpa: u64) -> Result<(), CallError> {
    IbvCall::<defs::GetDeviceName>::run(session, gpa, |req, output| {
        let gm = session.guest_memory();
        let device = session.resolve(req.device, ResourceKind::Device)?;
        let name_gpa = req.ret;
        gm.translate(name_gpa, IBV_SYSFS_NAME_MAX)
            .map_err(CallError::OutOfBounds)?;

        let Some(name) = session.verbs().get_device_name(device) else {
            req.ret = NULL_HANDLE;
            return Ok(());
        };
        let name = name.as_bytes_with_nul();
        if name.len() > IBV_SYSFS_NAME_MAX {
            return Err(CallError::NameTooLong {
                len: name.len(),
                capacity: IBV_SYSFS_NAME_MAX,
            });
        }
        output.write(name_gpa, name)
    })
}

/// `IBV_OPEN_DEVICE`: opens a context and returns its handle.
pub fn open_device(session: &IbvSession, gpa: u64) -> Result<(), CallError> {
    IbvCall::<defs::OpenDevice>::run(session, gpa, |req, _| {
        let device = session.resolve(req.device, ResourceKind::Device)?;
        req.ret = match session.verbs().open_device(device) {
            Some(context) => session.register(context, ResourceKind::Context)?,
            None => NULL_HANDLE,
        };
        Ok(())
    })
}

/// `IBV_QUERY_PORT`: writes the port attributes to the guest buffer and
/// returns the native status unchanged.
pub fn query_port(session: &IbvSession, gpa: u64) -> Result<(), CallError> {
    IbvCall::<defs::QueryPort>::run(session, gpa, |req, output| {
        let gm = session.guest_memory();
        let context = session.resolve(req.context, ResourceKind::Context)?;
        let attr_gpa = req.port_attr;
        gm.translate(attr_gpa, size_of::<PortAttr>())
            .map_err(CallError::OutOfBounds)?;

        let mut attr = PortAttr::default();
        let status = session.verbs().query_port(context, req.port_num, &mut attr);
        if status == 0 {
            output.write_plain(attr_gpa, &attr)?;
        }
        req.ret = status;
        Ok(())
    })
}

/// `IBV_CREATE_COMP_CHANNEL`: creates a completion channel and returns its
/// handle.
pub fn create_comp_channel(session: &IbvSession, gpa: u64) -> Result<(), CallError> {
    IbvCall::<defs::CreateCompChannel>::run(session, gpa, |req, _| {
        let context = session.resolve(req.context, ResourceKind::Context)?;
        req.ret = match session.verbs().create_comp_channel(context) {
            Some(channel) => session.register(channel, ResourceKind::CompChannel)?,
            None => NULL_HANDLE,
        };
        Ok(())
    })
}

/// `KERNEL_IBV_LOG`: logs the NUL-terminated guest string at `gpa`.
pub fn kernel_ibv_log(session: &IbvSession, gpa: u64) -> Result<(), CallError> {
    let line = session
        .guest_memory()
        .read_cstr(gpa, session.config().max_log_len)
        .map_err(CallError::Request)?;
    info_ratelimited!(
        session.guest_log_limiter(),
        target: "ibv_guest",
        "{}",
        String::from_utf8_lossy(&line).trim_end()
    );
    Ok(())
}

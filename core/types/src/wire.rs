//! Command body codecs.
//!
//! Every body is a fixed little-endian struct (interface names occupy a
//! fixed 256-byte NUL-padded field), so each command has an exact body
//! size; batched commands append a run of fixed-size entries behind their
//! header. Encoding writes into a `BufMut`, decoding consumes from a `Buf`
//! and fails on truncation instead of panicking.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::interface::{get_name, put_name};
use crate::{ImplVersion, InterfaceDescription, InterfaceVersion, NotificationId, PartyId, PulseInfo};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated frame body")]
    Truncated,
    #[error("bad frame magic")]
    BadMagic,
    #[error("interface name is not valid")]
    BadName,
    #[error("implausible element count {0}")]
    BadCount(u32),
}

/// Guards every multi-byte read; `bytes` panics on underflow otherwise.
pub(crate) fn ensure(buf: &impl Buf, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(())
}

/// Upper bound on list/batch element counts accepted from the wire.
const MAX_ELEMENT_COUNT: u32 = 4096;

fn get_count(buf: &mut impl Buf) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    let count = buf.get_u32_le();
    if count > MAX_ELEMENT_COUNT {
        return Err(WireError::BadCount(count));
    }
    Ok(count)
}

/// Server channel coordinates handed back to attaching clients: node id
/// (0 = the broker's own node), process id or IPv4 address, channel id or
/// TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelInfo {
    pub nid: u32,
    pub pid: i32,
    pub chid: i32,
}

impl ChannelInfo {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.nid);
        buf.put_i32_le(self.pid);
        buf.put_i32_le(self.chid);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, 12)?;
        Ok(Self {
            nid: buf.get_u32_le(),
            pid: buf.get_i32_le(),
            chid: buf.get_i32_le(),
        })
    }
}

/// Everything a client learns from a successful attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionInfo {
    pub if_version: InterfaceVersion,
    pub channel: ChannelInfo,
    pub server_id: PartyId,
    pub client_id: PartyId,
}

impl ConnectionInfo {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.if_version.put(buf);
        self.channel.put(buf);
        self.server_id.put(buf);
        self.client_id.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            if_version: InterfaceVersion::get(buf)?,
            channel: ChannelInfo::get(buf)?,
            server_id: PartyId::get(buf)?,
            client_id: PartyId::get(buf)?,
        })
    }
}

/// Server coordinates without a client id, as returned by
/// `GET_SERVER_INFORMATION` and kept in the remote-server cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerInfo {
    pub channel: ChannelInfo,
    pub server_id: PartyId,
}

impl ServerInfo {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.channel.put(buf);
        self.server_id.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            channel: ChannelInfo::get(buf)?,
            server_id: PartyId::get(buf)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInterface {
    pub sb_version: InterfaceVersion,
    pub iface: InterfaceDescription,
    pub impl_version: ImplVersion,
    pub chid: i32,
    pub pid: i32,
}

impl RegisterInterface {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        self.iface.put(buf);
        self.impl_version.put(buf);
        buf.put_i32_le(self.chid);
        buf.put_i32_le(self.pid);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        let iface = InterfaceDescription::get(buf)?;
        let impl_version = ImplVersion::get(buf)?;
        ensure(buf, 8)?;
        let chid = buf.get_i32_le();
        let pid = buf.get_i32_le();
        Ok(Self {
            sb_version,
            iface,
            impl_version,
            chid,
            pid,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInterfaceGroupId {
    pub register: RegisterInterface,
    pub gid: i32,
}

impl RegisterInterfaceGroupId {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.register.put(buf);
        buf.put_i32_le(self.gid);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let register = RegisterInterface::get(buf)?;
        ensure(buf, 4)?;
        Ok(Self {
            register,
            gid: buf.get_i32_le(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInterfaceEx {
    pub sb_version: InterfaceVersion,
    pub impl_version: ImplVersion,
    pub chid: i32,
    pub pid: i32,
    pub interfaces: Vec<InterfaceDescription>,
}

impl RegisterInterfaceEx {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        self.impl_version.put(buf);
        buf.put_i32_le(self.chid);
        buf.put_i32_le(self.pid);
        buf.put_u32_le(self.interfaces.len() as u32);
        for iface in &self.interfaces {
            iface.put(buf);
        }
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        let impl_version = ImplVersion::get(buf)?;
        ensure(buf, 8)?;
        let chid = buf.get_i32_le();
        let pid = buf.get_i32_le();
        let count = get_count(buf)?;
        let mut interfaces = Vec::with_capacity(count as usize);
        for _ in 0..count {
            interfaces.push(InterfaceDescription::get(buf)?);
        }
        Ok(Self {
            sb_version,
            impl_version,
            chid,
            pid,
            interfaces,
        })
    }
}

/// One forwarded interface inside `REGISTER_MASTER_INTERFACE_EX`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterInterfaceEntry {
    pub impl_version: ImplVersion,
    pub chid: i32,
    pub pid: i32,
    pub nd: i32,
    pub server_id: PartyId,
    pub iface: InterfaceDescription,
}

impl MasterInterfaceEntry {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.impl_version.put(buf);
        buf.put_i32_le(self.chid);
        buf.put_i32_le(self.pid);
        buf.put_i32_le(self.nd);
        self.server_id.put(buf);
        self.iface.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let impl_version = ImplVersion::get(buf)?;
        ensure(buf, 12)?;
        let chid = buf.get_i32_le();
        let pid = buf.get_i32_le();
        let nd = buf.get_i32_le();
        let server_id = PartyId::get(buf)?;
        let iface = InterfaceDescription::get(buf)?;
        Ok(Self {
            impl_version,
            chid,
            pid,
            nd,
            server_id,
            iface,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMasterInterfaceEx {
    pub sb_version: InterfaceVersion,
    pub entries: Vec<MasterInterfaceEntry>,
}

impl RegisterMasterInterfaceEx {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            entry.put(buf);
        }
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        let count = get_count(buf)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(MasterInterfaceEntry::get(buf)?);
        }
        Ok(Self { sb_version, entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisterInterface {
    pub sb_version: InterfaceVersion,
    pub server_id: PartyId,
}

impl UnregisterInterface {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        buf.put_u32_le(0); // reserved
        self.server_id.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        ensure(buf, 4)?;
        let _reserved = buf.get_u32_le();
        Ok(Self {
            sb_version,
            server_id: PartyId::get(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachInterface {
    pub sb_version: InterfaceVersion,
    pub iface: InterfaceDescription,
}

impl AttachInterface {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        self.iface.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            sb_version: InterfaceVersion::get(buf)?,
            iface: InterfaceDescription::get(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachInterfaceExtended {
    pub sb_version: InterfaceVersion,
    pub pulse: PulseInfo,
    pub iface: InterfaceDescription,
}

impl AttachInterfaceExtended {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        self.pulse.put(buf);
        self.iface.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            sb_version: InterfaceVersion::get(buf)?,
            pulse: PulseInfo::get(buf)?,
            iface: InterfaceDescription::get(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachInterface {
    pub sb_version: InterfaceVersion,
    pub client_id: PartyId,
}

impl DetachInterface {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        buf.put_u32_le(0); // reserved
        self.client_id.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        ensure(buf, 4)?;
        let _reserved = buf.get_u32_le();
        Ok(Self {
            sb_version,
            client_id: PartyId::get(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyServerDisconnect {
    pub sb_version: InterfaceVersion,
    pub server_id: PartyId,
    pub pulse: PulseInfo,
}

impl NotifyServerDisconnect {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        buf.put_u32_le(0); // reserved
        self.server_id.put(buf);
        self.pulse.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        ensure(buf, 4)?;
        let _reserved = buf.get_u32_le();
        Ok(Self {
            sb_version,
            server_id: PartyId::get(buf)?,
            pulse: PulseInfo::get(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyServerAvailable {
    pub sb_version: InterfaceVersion,
    pub pulse: PulseInfo,
    pub iface: InterfaceDescription,
}

impl NotifyServerAvailable {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        self.pulse.put(buf);
        self.iface.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            sb_version: InterfaceVersion::get(buf)?,
            pulse: PulseInfo::get(buf)?,
            iface: InterfaceDescription::get(buf)?,
        })
    }
}

/// One entry inside the batched `NOTIFY_SERVER_AVAILABLE_EX`; the cookie is
/// echoed in the reply so the sender can correlate allocated ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDescription {
    pub cookie: u32,
    pub pulse: PulseInfo,
    pub iface: InterfaceDescription,
}

impl NotificationDescription {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.cookie);
        self.pulse.put(buf);
        self.iface.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, 4)?;
        Ok(Self {
            cookie: buf.get_u32_le(),
            pulse: PulseInfo::get(buf)?,
            iface: InterfaceDescription::get(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyServerAvailableEx {
    pub sb_version: InterfaceVersion,
    pub entries: Vec<NotificationDescription>,
}

impl NotifyServerAvailableEx {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            entry.put(buf);
        }
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        let count = get_count(buf)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(NotificationDescription::get(buf)?);
        }
        Ok(Self { sb_version, entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyClientDetach {
    pub sb_version: InterfaceVersion,
    pub client_id: PartyId,
    pub pulse: PulseInfo,
}

impl NotifyClientDetach {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        buf.put_u32_le(0); // reserved
        self.client_id.put(buf);
        self.pulse.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        ensure(buf, 4)?;
        let _reserved = buf.get_u32_le();
        Ok(Self {
            sb_version,
            client_id: PartyId::get(buf)?,
            pulse: PulseInfo::get(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearNotification {
    pub sb_version: InterfaceVersion,
    pub notification_id: NotificationId,
}

impl ClearNotification {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        buf.put_u32_le(self.notification_id);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        ensure(buf, 4)?;
        Ok(Self {
            sb_version,
            notification_id: buf.get_u32_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetInterfaceList {
    pub sb_version: InterfaceVersion,
    pub in_count: u32,
}

impl GetInterfaceList {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        buf.put_u32_le(self.in_count);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        ensure(buf, 4)?;
        Ok(Self {
            sb_version,
            in_count: buf.get_u32_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyInterfaceListChange {
    pub sb_version: InterfaceVersion,
    pub pulse: PulseInfo,
}

impl NotifyInterfaceListChange {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        self.pulse.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            sb_version: InterfaceVersion::get(buf)?,
            pulse: PulseInfo::get(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchInterfaceList {
    pub sb_version: InterfaceVersion,
    pub in_count: u32,
    pub regex: String,
}

impl MatchInterfaceList {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        buf.put_u32_le(self.in_count);
        put_name(buf, &self.regex);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        ensure(buf, 4)?;
        let in_count = buf.get_u32_le();
        Ok(Self {
            sb_version,
            in_count,
            regex: get_name(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyInterfaceListMatch {
    pub sb_version: InterfaceVersion,
    pub pulse: PulseInfo,
    pub regex: String,
}

impl NotifyInterfaceListMatch {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        self.pulse.put(buf);
        put_name(buf, &self.regex);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            sb_version: InterfaceVersion::get(buf)?,
            pulse: PulseInfo::get(buf)?,
            regex: get_name(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterPingId {
    pub sb_version: InterfaceVersion,
    pub extended_id: u32,
}

impl MasterPingId {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.sb_version.put(buf);
        buf.put_u32_le(self.extended_id);
        buf.put_u32_le(0); // reserved
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sb_version = InterfaceVersion::get(buf)?;
        ensure(buf, 8)?;
        let extended_id = buf.get_u32_le();
        let _reserved = buf.get_u32_le();
        Ok(Self {
            sb_version,
            extended_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

/// Reply carrying a single allocated party id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerIdReply {
    pub server_id: PartyId,
}

impl ServerIdReply {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.server_id.put(buf);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            server_id: PartyId::get(buf)?,
        })
    }
}

/// Reply carrying a freshly armed notification id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationIdReply {
    pub notification_id: NotificationId,
}

impl NotificationIdReply {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.notification_id);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, 4)?;
        Ok(Self {
            notification_id: buf.get_u32_le(),
        })
    }
}

/// `{cookie, notification_id}` pair echoed per batched notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookieNotificationId {
    pub cookie: u32,
    pub notification_id: NotificationId,
}

impl CookieNotificationId {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.cookie);
        buf.put_u32_le(self.notification_id);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, 8)?;
        Ok(Self {
            cookie: buf.get_u32_le(),
            notification_id: buf.get_u32_le(),
        })
    }
}

/// Attach-extended reply: connection info plus the notification id that was
/// armed along the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttachExtendedReply {
    pub conn: ConnectionInfo,
    pub notification_id: NotificationId,
}

impl AttachExtendedReply {
    pub fn put(&self, buf: &mut impl BufMut) {
        self.conn.put(buf);
        buf.put_u32_le(self.notification_id);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let conn = ConnectionInfo::get(buf)?;
        ensure(buf, 4)?;
        Ok(Self {
            conn,
            notification_id: buf.get_u32_le(),
        })
    }
}

/// Decodes a run of party ids (batched registration replies).
pub fn get_party_ids(buf: &mut impl Buf, count: usize) -> Result<Vec<PartyId>, WireError> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(PartyId::get(buf)?);
    }
    Ok(ids)
}

/// Decodes a run of interface descriptions (list replies, where the count
/// comes from the negated return code).
pub fn get_interfaces(
    buf: &mut impl Buf,
    count: usize,
) -> Result<Vec<InterfaceDescription>, WireError> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(InterfaceDescription::get(buf)?);
    }
    Ok(out)
}

/// Decodes a run of cookie/notification-id pairs.
pub fn get_cookie_notification_ids(
    buf: &mut impl Buf,
    count: usize,
) -> Result<Vec<CookieNotificationId>, WireError> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(CookieNotificationId::get(buf)?);
    }
    Ok(out)
}

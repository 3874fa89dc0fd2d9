/// [`u8`]: **Port number**, identifies a physical port on an RDMA adapter. Starts from 1.
pub type PortNum = u8;

/// [`u16`]: **Local identifier (LID)**, addresses a port inside an InfiniBand subnet.
pub type Lid = u16;

/// [`u8`]: **Global identifier (GID) index**, selects an entry of a port's GID table.
pub type GidIndex = u8;

/// [`u32`]: **Queue pair number**, identifies a queue pair on its device. Only the low 24 bits are used.
pub type Qpn = u32;

/// [`u32`]: **Packet sequence number (PSN)**, numbers packets of one direction of a connection.
/// Only the low 24 bits are carried on the wire.
pub type Psn = u32;

/// [`u32`]: **Local key**, authorizes local access to a registered memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, authorizes remote access to a registered memory region.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, chosen by the submitter to correlate a request with its completion.
pub type WrId = u64;

/// Mask of the bits of a [`Psn`] that are meaningful on the wire.
pub const PSN_MASK: Psn = 0x00ff_ffff;

//! Hardware register layout (spec.md §6 "Hardware register layout (MSR
//! backend)"). Out of scope as an engineering problem — this is an
//! opaque constant table consumed by the allocation/monitoring engines,
//! not something the engine reasons about structurally.

/// `PQR_ASSOC`: per-logical-core register combining the active RMID
/// (low bits) and COS (high bits).
pub const IA32_PQR_ASSOC: u32 = 0x0C8F;
pub const PQR_ASSOC_RMID_BITS: u32 = 10;
pub const PQR_ASSOC_RMID_MASK: u64 = (1u64 << PQR_ASSOC_RMID_BITS) - 1;

pub const IA32_L3_QOS_MASK_BASE: u32 = 0x0C90;
pub const IA32_L2_QOS_MASK_BASE: u32 = 0x0D10;
pub const IA32_MBA_MASK_BASE: u32 = 0x0D50;
pub const AMD_L3_QOS_MASK_BASE: u32 = 0xC000_0900;
pub const AMD_MBA_MASK_BASE: u32 = 0xC000_0208;
pub const AMD_SMBA_MASK_BASE: u32 = 0xC000_0280;

/// CDP/I-O-RDT/MBA4.0 enable-bit registers.
pub const IA32_L3_QOS_CFG: u32 = 0x0C81;
pub const IA32_L2_QOS_CFG: u32 = 0x0C82;
pub const IA32_L3_IO_QOS_CFG: u32 = 0x0C8C;
pub const IA32_MBA_CFG: u32 = 0x0C84;

pub const QOS_CFG_ENABLE_BIT: u64 = 1;

/// Monitoring: event-select / counter registers (`IA32_QM_EVTSEL`,
/// `IA32_QM_CTR`). `IA32_QM_EVTSEL` packs the target RMID into bits
/// 63:32 and the event id into bits 7:0 — a read of `IA32_QM_CTR`
/// reports that specific (RMID, event) pair's counter, not whatever
/// RMID happens to be associated with the reading core.
pub const IA32_QM_EVTSEL: u32 = 0x0C8D;
pub const IA32_QM_CTR: u32 = 0x0C8E;
pub const QM_EVTSEL_RMID_SHIFT: u32 = 32;
pub const QM_CTR_ERROR_BIT: u64 = 1 << 63;
pub const QM_CTR_UNAVAILABLE_BIT: u64 = 1 << 62;

/// Event ids used in `IA32_QM_EVTSEL`'s low byte.
pub const QM_EVENT_L3_OCCUPANCY: u8 = 0x01;
pub const QM_EVENT_TOTAL_BW: u8 = 0x02;
pub const QM_EVENT_LOCAL_BW: u8 = 0x03;

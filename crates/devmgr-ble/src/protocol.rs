//! BLE service and characteristic catalogue for device management

use core::fmt;

use devmgr_core::{MgmtProto, ResourceType};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// UUID Helpers
// ----------------------------------------------------------------------------

/// Expand a 16-bit Bluetooth SIG UUID onto the base UUID
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB)
}

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Management (NMP) service
pub const NMP_SERVICE_UUID: Uuid = Uuid::from_u128(0x8D53DC1D_1DB7_4CD3_868B_8A527460AA84);

/// Management characteristic, used for both requests and responses
pub const NMP_CHR_UUID: Uuid = Uuid::from_u128(0xDA2E7828_FBCE_4E01_AE9E_261174997C48);

/// Unsecured OIC resource service
pub const UNAUTH_SERVICE_UUID: Uuid = Uuid::from_u128(0xADE3D529_C784_4F63_A987_EB69F70EE816);
pub const UNAUTH_REQ_CHR_UUID: Uuid = Uuid::from_u128(0xAD7B334F_4637_4B86_90B6_9D787F03D218);
pub const UNAUTH_RSP_CHR_UUID: Uuid = Uuid::from_u128(0xE9241982_4580_42C4_8831_95048216B256);

/// Secured OIC resource service
pub const SECURE_SERVICE_UUID: Uuid = uuid16(0xFE18);
pub const SECURE_REQ_CHR_UUID: Uuid = uuid16(0x1000);
pub const SECURE_RSP_CHR_UUID: Uuid = uuid16(0x1001);

/// Public resource service
pub const PUBLIC_SERVICE_UUID: Uuid = uuid16(0x9000);
pub const PUBLIC_REQ_CHR_UUID: Uuid = uuid16(0x9001);
pub const PUBLIC_RSP_CHR_UUID: Uuid = uuid16(0x9002);

// ----------------------------------------------------------------------------
// Characteristic Identifiers
// ----------------------------------------------------------------------------

/// Service/characteristic UUID pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChrId {
    pub svc_uuid: Uuid,
    pub chr_uuid: Uuid,
}

impl ChrId {
    pub const fn new(svc_uuid: Uuid, chr_uuid: Uuid) -> Self {
        Self { svc_uuid, chr_uuid }
    }
}

impl fmt::Display for ChrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s={} c={}", self.svc_uuid, self.chr_uuid)
    }
}

/// Characteristics a session uses, resolved once from the management
/// protocol. `None` means the protocol has no such channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MgmtChrs {
    pub nmp_req_chr: Option<ChrId>,
    pub nmp_rsp_chr: Option<ChrId>,
    pub res_public_req_chr: Option<ChrId>,
    pub res_public_rsp_chr: Option<ChrId>,
    pub res_unauth_req_chr: Option<ChrId>,
    pub res_unauth_rsp_chr: Option<ChrId>,
    pub res_secure_req_chr: Option<ChrId>,
    pub res_secure_rsp_chr: Option<ChrId>,
}

impl MgmtChrs {
    pub fn for_proto(proto: MgmtProto) -> Self {
        let public_req = ChrId::new(PUBLIC_SERVICE_UUID, PUBLIC_REQ_CHR_UUID);
        let public_rsp = ChrId::new(PUBLIC_SERVICE_UUID, PUBLIC_RSP_CHR_UUID);
        let unauth_req = ChrId::new(UNAUTH_SERVICE_UUID, UNAUTH_REQ_CHR_UUID);
        let unauth_rsp = ChrId::new(UNAUTH_SERVICE_UUID, UNAUTH_RSP_CHR_UUID);
        let secure_req = ChrId::new(SECURE_SERVICE_UUID, SECURE_REQ_CHR_UUID);
        let secure_rsp = ChrId::new(SECURE_SERVICE_UUID, SECURE_RSP_CHR_UUID);

        match proto {
            MgmtProto::Nmp => {
                let nmp = ChrId::new(NMP_SERVICE_UUID, NMP_CHR_UUID);
                Self {
                    nmp_req_chr: Some(nmp),
                    nmp_rsp_chr: Some(nmp),
                    ..Self::default()
                }
            }
            MgmtProto::Omp => Self {
                nmp_req_chr: Some(unauth_req),
                nmp_rsp_chr: Some(unauth_rsp),
                res_public_req_chr: Some(public_req),
                res_public_rsp_chr: Some(public_rsp),
                res_unauth_req_chr: Some(unauth_req),
                res_unauth_rsp_chr: Some(unauth_rsp),
                res_secure_req_chr: Some(secure_req),
                res_secure_rsp_chr: Some(secure_rsp),
            },
        }
    }

    /// Request characteristic for a resource type
    pub fn res_req_chr(&self, rt: ResourceType) -> Option<ChrId> {
        match rt {
            ResourceType::Public => self.res_public_req_chr,
            ResourceType::Unauth => self.res_unauth_req_chr,
            ResourceType::Secure => self.res_secure_req_chr,
        }
    }
}

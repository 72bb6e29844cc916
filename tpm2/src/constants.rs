// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants, command codes and per-command metadata

/// Wire shape of a command, as far as the framer, the session engine and the
/// resource manager need to know it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    /// Handles in the command handle area
    pub in_handles: usize,
    /// Handles in the response handle area
    pub out_handles: usize,
    /// First command parameter is a TPM2B (eligible for decrypt sessions)
    pub sized_command_param: bool,
    /// First response parameter is a TPM2B (eligible for encrypt sessions)
    pub sized_response_param: bool,
}

const fn info(in_handles: usize, out_handles: usize, cmd: bool, rsp: bool) -> CommandInfo {
    CommandInfo {
        in_handles,
        out_handles,
        sized_command_param: cmd,
        sized_response_param: rsp,
    }
}

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmCc {
    NvUndefineSpaceSpecial = 0x0000011F,
    EvictControl = 0x00000120,
    HierarchyControl = 0x00000121,
    NvUndefineSpace = 0x00000122,
    ChangeEps = 0x00000124,
    ChangePps = 0x00000125,
    Clear = 0x00000126,
    ClearControl = 0x00000127,
    ClockSet = 0x00000128,
    HierarchyChangeAuth = 0x00000129,
    NvDefineSpace = 0x0000012A,
    PcrAllocate = 0x0000012B,
    PcrSetAuthPolicy = 0x0000012C,
    PpCommands = 0x0000012D,
    SetPrimaryPolicy = 0x0000012E,
    FieldUpgradeStart = 0x0000012F,
    ClockRateAdjust = 0x00000130,
    CreatePrimary = 0x00000131,
    NvGlobalWriteLock = 0x00000132,
    GetCommandAuditDigest = 0x00000133,
    NvIncrement = 0x00000134,
    NvSetBits = 0x00000135,
    NvExtend = 0x00000136,
    NvWrite = 0x00000137,
    NvWriteLock = 0x00000138,
    DictionaryAttackLockReset = 0x00000139,
    DictionaryAttackParameters = 0x0000013A,
    NvChangeAuth = 0x0000013B,
    PcrEvent = 0x0000013C,
    PcrReset = 0x0000013D,
    SequenceComplete = 0x0000013E,
    SetAlgorithmSet = 0x0000013F,
    SetCommandCodeAuditStatus = 0x00000140,
    FieldUpgradeData = 0x00000141,
    IncrementalSelfTest = 0x00000142,
    SelfTest = 0x00000143,
    Startup = 0x00000144,
    Shutdown = 0x00000145,
    StirRandom = 0x00000146,
    ActivateCredential = 0x00000147,
    Certify = 0x00000148,
    PolicyNv = 0x00000149,
    CertifyCreation = 0x0000014A,
    Duplicate = 0x0000014B,
    GetTime = 0x0000014C,
    GetSessionAuditDigest = 0x0000014D,
    NvRead = 0x0000014E,
    NvReadLock = 0x0000014F,
    ObjectChangeAuth = 0x00000150,
    PolicySecret = 0x00000151,
    Rewrap = 0x00000152,
    Create = 0x00000153,
    EcdhZGen = 0x00000154,
    Hmac = 0x00000155,
    Import = 0x00000156,
    Load = 0x00000157,
    Quote = 0x00000158,
    RsaDecrypt = 0x00000159,
    HmacStart = 0x0000015B,
    SequenceUpdate = 0x0000015C,
    Sign = 0x0000015D,
    Unseal = 0x0000015E,
    PolicySigned = 0x00000160,
    ContextLoad = 0x00000161,
    ContextSave = 0x00000162,
    EcdhKeyGen = 0x00000163,
    EncryptDecrypt = 0x00000164,
    FlushContext = 0x00000165,
    LoadExternal = 0x00000167,
    MakeCredential = 0x00000168,
    NvReadPublic = 0x00000169,
    PolicyAuthorize = 0x0000016A,
    PolicyAuthValue = 0x0000016B,
    PolicyCommandCode = 0x0000016C,
    PolicyCounterTimer = 0x0000016D,
    PolicyCpHash = 0x0000016E,
    PolicyLocality = 0x0000016F,
    PolicyNameHash = 0x00000170,
    PolicyOr = 0x00000171,
    PolicyTicket = 0x00000172,
    ReadPublic = 0x00000173,
    RsaEncrypt = 0x00000174,
    StartAuthSession = 0x00000176,
    VerifySignature = 0x00000177,
    EccParameters = 0x00000178,
    FirmwareRead = 0x00000179,
    GetCapability = 0x0000017A,
    GetRandom = 0x0000017B,
    GetTestResult = 0x0000017C,
    Hash = 0x0000017D,
    PcrRead = 0x0000017E,
    PolicyPcr = 0x0000017F,
    PolicyRestart = 0x00000180,
    ReadClock = 0x00000181,
    PcrExtend = 0x00000182,
    PcrSetAuthValue = 0x00000183,
    NvCertify = 0x00000184,
    EventSequenceComplete = 0x00000185,
    HashSequenceStart = 0x00000186,
    PolicyPhysicalPresence = 0x00000187,
    PolicyDuplicationSelect = 0x00000188,
    PolicyGetDigest = 0x00000189,
    TestParms = 0x0000018A,
    Commit = 0x0000018B,
    PolicyPassword = 0x0000018C,
    ZGen2Phase = 0x0000018D,
    EcEphemeral = 0x0000018E,
    PolicyNvWritten = 0x0000018F,
    PolicyTemplate = 0x00000190,
    CreateLoaded = 0x00000191,
    PolicyAuthorizeNv = 0x00000192,
    EncryptDecrypt2 = 0x00000193,
}

impl TpmCc {
    const ALL: &'static [TpmCc] = &[
        TpmCc::NvUndefineSpaceSpecial,
        TpmCc::EvictControl,
        TpmCc::HierarchyControl,
        TpmCc::NvUndefineSpace,
        TpmCc::ChangeEps,
        TpmCc::ChangePps,
        TpmCc::Clear,
        TpmCc::ClearControl,
        TpmCc::ClockSet,
        TpmCc::HierarchyChangeAuth,
        TpmCc::NvDefineSpace,
        TpmCc::PcrAllocate,
        TpmCc::PcrSetAuthPolicy,
        TpmCc::PpCommands,
        TpmCc::SetPrimaryPolicy,
        TpmCc::FieldUpgradeStart,
        TpmCc::ClockRateAdjust,
        TpmCc::CreatePrimary,
        TpmCc::NvGlobalWriteLock,
        TpmCc::GetCommandAuditDigest,
        TpmCc::NvIncrement,
        TpmCc::NvSetBits,
        TpmCc::NvExtend,
        TpmCc::NvWrite,
        TpmCc::NvWriteLock,
        TpmCc::DictionaryAttackLockReset,
        TpmCc::DictionaryAttackParameters,
        TpmCc::NvChangeAuth,
        TpmCc::PcrEvent,
        TpmCc::PcrReset,
        TpmCc::SequenceComplete,
        TpmCc::SetAlgorithmSet,
        TpmCc::SetCommandCodeAuditStatus,
        TpmCc::FieldUpgradeData,
        TpmCc::IncrementalSelfTest,
        TpmCc::SelfTest,
        TpmCc::Startup,
        TpmCc::Shutdown,
        TpmCc::StirRandom,
        TpmCc::ActivateCredential,
        TpmCc::Certify,
        TpmCc::PolicyNv,
        TpmCc::CertifyCreation,
        TpmCc::Duplicate,
        TpmCc::GetTime,
        TpmCc::GetSessionAuditDigest,
        TpmCc::NvRead,
        TpmCc::NvReadLock,
        TpmCc::ObjectChangeAuth,
        TpmCc::PolicySecret,
        TpmCc::Rewrap,
        TpmCc::Create,
        TpmCc::EcdhZGen,
        TpmCc::Hmac,
        TpmCc::Import,
        TpmCc::Load,
        TpmCc::Quote,
        TpmCc::RsaDecrypt,
        TpmCc::HmacStart,
        TpmCc::SequenceUpdate,
        TpmCc::Sign,
        TpmCc::Unseal,
        TpmCc::PolicySigned,
        TpmCc::ContextLoad,
        TpmCc::ContextSave,
        TpmCc::EcdhKeyGen,
        TpmCc::EncryptDecrypt,
        TpmCc::FlushContext,
        TpmCc::LoadExternal,
        TpmCc::MakeCredential,
        TpmCc::NvReadPublic,
        TpmCc::PolicyAuthorize,
        TpmCc::PolicyAuthValue,
        TpmCc::PolicyCommandCode,
        TpmCc::PolicyCounterTimer,
        TpmCc::PolicyCpHash,
        TpmCc::PolicyLocality,
        TpmCc::PolicyNameHash,
        TpmCc::PolicyOr,
        TpmCc::PolicyTicket,
        TpmCc::ReadPublic,
        TpmCc::RsaEncrypt,
        TpmCc::StartAuthSession,
        TpmCc::VerifySignature,
        TpmCc::EccParameters,
        TpmCc::FirmwareRead,
        TpmCc::GetCapability,
        TpmCc::GetRandom,
        TpmCc::GetTestResult,
        TpmCc::Hash,
        TpmCc::PcrRead,
        TpmCc::PolicyPcr,
        TpmCc::PolicyRestart,
        TpmCc::ReadClock,
        TpmCc::PcrExtend,
        TpmCc::PcrSetAuthValue,
        TpmCc::NvCertify,
        TpmCc::EventSequenceComplete,
        TpmCc::HashSequenceStart,
        TpmCc::PolicyPhysicalPresence,
        TpmCc::PolicyDuplicationSelect,
        TpmCc::PolicyGetDigest,
        TpmCc::TestParms,
        TpmCc::Commit,
        TpmCc::PolicyPassword,
        TpmCc::ZGen2Phase,
        TpmCc::EcEphemeral,
        TpmCc::PolicyNvWritten,
        TpmCc::PolicyTemplate,
        TpmCc::CreateLoaded,
        TpmCc::PolicyAuthorizeNv,
        TpmCc::EncryptDecrypt2,
    ];

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|cc| cc.to_u32() == v)
    }

    /// Handle counts and parameter-encryption eligibility (TPM 2.0 Part 3).
    ///
    /// `FlushContext` carries its handle in the parameter area, but at the
    /// same byte offset as a handle would be, so it is described as a
    /// one-handle command.
    pub fn info(self) -> CommandInfo {
        use TpmCc::*;
        match self {
            NvUndefineSpaceSpecial => info(2, 0, false, false),
            EvictControl => info(2, 0, false, false),
            HierarchyControl => info(1, 0, false, false),
            NvUndefineSpace => info(2, 0, false, false),
            ChangeEps | ChangePps | Clear | ClearControl | ClockSet => info(1, 0, false, false),
            HierarchyChangeAuth => info(1, 0, true, false),
            NvDefineSpace => info(1, 0, true, false),
            PcrAllocate | PcrSetAuthPolicy | PpCommands => info(1, 0, false, false),
            SetPrimaryPolicy => info(1, 0, true, false),
            FieldUpgradeStart => info(2, 0, true, false),
            ClockRateAdjust => info(1, 0, false, false),
            CreatePrimary => info(1, 1, true, true),
            NvGlobalWriteLock => info(1, 0, false, false),
            GetCommandAuditDigest => info(2, 0, true, true),
            NvIncrement | NvSetBits => info(2, 0, false, false),
            NvExtend | NvWrite => info(2, 0, true, false),
            NvWriteLock => info(2, 0, false, false),
            DictionaryAttackLockReset | DictionaryAttackParameters => info(1, 0, false, false),
            NvChangeAuth => info(1, 0, true, false),
            PcrEvent => info(1, 0, true, false),
            PcrReset => info(1, 0, false, false),
            SequenceComplete => info(1, 0, true, true),
            SetAlgorithmSet | SetCommandCodeAuditStatus => info(1, 0, false, false),
            FieldUpgradeData => info(0, 0, true, false),
            IncrementalSelfTest | SelfTest | Startup | Shutdown => info(0, 0, false, false),
            StirRandom => info(0, 0, true, false),
            ActivateCredential => info(2, 0, true, true),
            Certify => info(2, 0, true, true),
            PolicyNv => info(3, 0, true, false),
            CertifyCreation => info(2, 0, true, true),
            Duplicate => info(2, 0, true, true),
            GetTime => info(2, 0, true, true),
            GetSessionAuditDigest => info(3, 0, true, true),
            NvRead => info(2, 0, false, true),
            NvReadLock => info(2, 0, false, false),
            ObjectChangeAuth => info(2, 0, true, true),
            PolicySecret => info(2, 0, true, true),
            Rewrap => info(2, 0, true, true),
            Create => info(1, 0, true, true),
            EcdhZGen => info(1, 0, false, false),
            Hmac => info(1, 0, true, true),
            Import => info(1, 0, true, true),
            Load => info(1, 1, true, true),
            Quote => info(1, 0, true, true),
            RsaDecrypt => info(1, 0, true, true),
            HmacStart => info(1, 1, true, false),
            SequenceUpdate => info(1, 0, true, false),
            Sign => info(1, 0, true, false),
            Unseal => info(1, 0, false, true),
            PolicySigned => info(2, 0, true, true),
            ContextLoad => info(0, 1, false, false),
            ContextSave => info(1, 0, false, false),
            EcdhKeyGen => info(1, 0, false, false),
            EncryptDecrypt => info(1, 0, false, true),
            FlushContext => info(1, 0, false, false),
            LoadExternal => info(0, 1, true, true),
            MakeCredential => info(1, 0, true, true),
            NvReadPublic => info(1, 0, false, true),
            PolicyAuthorize => info(1, 0, true, false),
            PolicyAuthValue | PolicyCommandCode => info(1, 0, false, false),
            PolicyCounterTimer | PolicyCpHash => info(1, 0, true, false),
            PolicyLocality => info(1, 0, false, false),
            PolicyNameHash => info(1, 0, true, false),
            PolicyOr => info(1, 0, false, false),
            PolicyTicket => info(1, 0, true, false),
            ReadPublic => info(1, 0, false, true),
            RsaEncrypt => info(1, 0, true, true),
            StartAuthSession => info(2, 1, true, true),
            VerifySignature => info(1, 0, true, false),
            EccParameters | FirmwareRead | GetCapability => info(0, 0, false, false),
            GetRandom => info(0, 0, false, true),
            GetTestResult => info(0, 0, false, true),
            Hash => info(0, 0, true, true),
            PcrRead => info(0, 0, false, false),
            PolicyPcr => info(1, 0, true, false),
            PolicyRestart => info(1, 0, false, false),
            ReadClock => info(0, 0, false, false),
            PcrExtend => info(1, 0, false, false),
            PcrSetAuthValue => info(1, 0, true, false),
            NvCertify => info(3, 0, true, true),
            EventSequenceComplete => info(2, 0, true, false),
            HashSequenceStart => info(0, 1, true, false),
            PolicyPhysicalPresence => info(1, 0, false, false),
            PolicyDuplicationSelect => info(1, 0, true, false),
            PolicyGetDigest => info(1, 0, false, true),
            TestParms => info(0, 0, false, false),
            Commit => info(1, 0, false, false),
            PolicyPassword => info(1, 0, false, false),
            ZGen2Phase => info(1, 0, false, false),
            EcEphemeral => info(0, 0, false, false),
            PolicyNvWritten => info(1, 0, false, false),
            PolicyTemplate => info(1, 0, true, false),
            CreateLoaded => info(1, 1, true, true),
            PolicyAuthorizeNv => info(3, 0, false, false),
            EncryptDecrypt2 => info(1, 0, true, true),
        }
    }
}

/// Response code format bits (TPM 2.0 Part 2, 6.6)
pub mod rc {
    pub const SUCCESS: u32 = 0x000;
    pub const RC_VER1: u32 = 0x100;
    pub const RC_FMT1: u32 = 0x080;
    pub const RC_WARN: u32 = 0x900;
    /// Format-one error refers to a handle (clear) or a session (set)
    pub const RC_S: u32 = 0x800;
    pub const RC_N_SHIFT: u32 = 8;
}

/// TPM 2.0 Response Codes (TPM_RC)
///
/// Format-one codes are reported without their parameter, handle or session
/// number; see [`TpmRc::from_u32`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmRc {
    Success,
    // Format 0 errors
    Initialize,
    Failure,
    Sequence,
    Disabled,
    Exclusive,
    AuthType,
    AuthMissing,
    Policy,
    Pcr,
    PcrChanged,
    NvRange,
    NvLocked,
    NvAuthorization,
    NvUninitialized,
    NvDefined,
    NvSpace,
    Locality,
    // Format 1 errors
    Asymmetric,
    Attributes,
    Hash,
    Value,
    Hierarchy,
    KeySize,
    Mgf,
    Mode,
    Type,
    Handle,
    Kdf,
    Range,
    AuthFail,
    Nonce,
    PolicyFail,
    Scheme,
    Size,
    Symmetric,
    Tag,
    Selector,
    Insufficient,
    Signature,
    Key,
    PolicyCc,
    Integrity,
    Ticket,
    BadAuth,
    Expired,
    Binding,
    // Warnings
    ContextGap,
    ObjectMemory,
    SessionMemory,
    Memory,
    SessionHandles,
    ObjectHandles,
    Yielded,
    Canceled,
    Testing,
    ReferenceH0,
    Retry,
    NvUnavailable,
    Other(u32),
}

impl TpmRc {
    pub fn from_u32(code: u32) -> Self {
        let base = if code & rc::RC_FMT1 != 0 {
            code & 0x0BF
        } else {
            code
        };
        match base {
            0x000 => TpmRc::Success,
            0x100 => TpmRc::Initialize,
            0x101 => TpmRc::Failure,
            0x103 => TpmRc::Sequence,
            0x120 => TpmRc::Disabled,
            0x121 => TpmRc::Exclusive,
            0x124 => TpmRc::AuthType,
            0x125 => TpmRc::AuthMissing,
            0x126 => TpmRc::Policy,
            0x127 => TpmRc::Pcr,
            0x128 => TpmRc::PcrChanged,
            0x146 => TpmRc::NvRange,
            0x148 => TpmRc::NvLocked,
            0x149 => TpmRc::NvAuthorization,
            0x14A => TpmRc::NvUninitialized,
            0x14B => TpmRc::NvSpace,
            0x14C => TpmRc::NvDefined,
            0x107 => TpmRc::Locality,
            0x081 => TpmRc::Asymmetric,
            0x082 => TpmRc::Attributes,
            0x083 => TpmRc::Hash,
            0x084 => TpmRc::Value,
            0x085 => TpmRc::Hierarchy,
            0x087 => TpmRc::KeySize,
            0x088 => TpmRc::Mgf,
            0x089 => TpmRc::Mode,
            0x08A => TpmRc::Type,
            0x08B => TpmRc::Handle,
            0x08C => TpmRc::Kdf,
            0x08D => TpmRc::Range,
            0x08E => TpmRc::AuthFail,
            0x08F => TpmRc::Nonce,
            0x090 => TpmRc::PolicyFail,
            0x092 => TpmRc::Scheme,
            0x095 => TpmRc::Size,
            0x096 => TpmRc::Symmetric,
            0x097 => TpmRc::Tag,
            0x098 => TpmRc::Selector,
            0x09A => TpmRc::Insufficient,
            0x09B => TpmRc::Signature,
            0x09C => TpmRc::Key,
            0x09D => TpmRc::PolicyCc,
            0x09F => TpmRc::Integrity,
            0x0A0 => TpmRc::Ticket,
            0x0A2 => TpmRc::BadAuth,
            0x0A3 => TpmRc::Expired,
            0x0A5 => TpmRc::Binding,
            0x901 => TpmRc::ContextGap,
            0x902 => TpmRc::ObjectMemory,
            0x903 => TpmRc::SessionMemory,
            0x904 => TpmRc::Memory,
            0x905 => TpmRc::SessionHandles,
            0x906 => TpmRc::ObjectHandles,
            0x908 => TpmRc::Yielded,
            0x909 => TpmRc::Canceled,
            0x90A => TpmRc::Testing,
            0x910 => TpmRc::ReferenceH0,
            0x922 => TpmRc::Retry,
            0x923 => TpmRc::NvUnavailable,
            _ => TpmRc::Other(code),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, TpmRc::Success)
    }

    /// Format-one handle error for the handle at `index` (zero-based).
    pub fn handle_error(index: usize) -> u32 {
        0x08B | (((index as u32) + 1) << rc::RC_N_SHIFT)
    }

    /// Format-one handle error for the session at `index` (zero-based).
    pub fn session_handle_error(index: usize) -> u32 {
        0x08B | rc::RC_S | (((index as u32) + 1) << rc::RC_N_SHIFT)
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Error = 0x0000,
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Aes = 0x0006,
    Mgf1 = 0x0007,
    KeyedHash = 0x0008,
    Xor = 0x000A,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    RsaSsa = 0x0014,
    RsaEs = 0x0015,
    RsaPss = 0x0016,
    Oaep = 0x0017,
    EcDsa = 0x0018,
    Ecdh = 0x0019,
    EcDaa = 0x001A,
    Sm2 = 0x001B,
    EcSchnorr = 0x001C,
    EcMqv = 0x001D,
    Kdf1Sp800_56a = 0x0020,
    Kdf2 = 0x0021,
    Kdf1Sp800_108 = 0x0022,
    Ecc = 0x0023,
    SymCipher = 0x0025,
    Ctr = 0x0040,
    Ofb = 0x0041,
    Cbc = 0x0042,
    Cfb = 0x0043,
    Ecb = 0x0044,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        use TpmAlgId::*;
        let alg = match v {
            0x0000 => Error,
            0x0001 => Rsa,
            0x0004 => Sha1,
            0x0005 => Hmac,
            0x0006 => Aes,
            0x0007 => Mgf1,
            0x0008 => KeyedHash,
            0x000A => Xor,
            0x000B => Sha256,
            0x000C => Sha384,
            0x000D => Sha512,
            0x0010 => Null,
            0x0014 => RsaSsa,
            0x0015 => RsaEs,
            0x0016 => RsaPss,
            0x0017 => Oaep,
            0x0018 => EcDsa,
            0x0019 => Ecdh,
            0x001A => EcDaa,
            0x001B => Sm2,
            0x001C => EcSchnorr,
            0x001D => EcMqv,
            0x0020 => Kdf1Sp800_56a,
            0x0021 => Kdf2,
            0x0022 => Kdf1Sp800_108,
            0x0023 => Ecc,
            0x0025 => SymCipher,
            0x0040 => Ctr,
            0x0041 => Ofb,
            0x0042 => Cbc,
            0x0043 => Cfb,
            0x0044 => Ecb,
            _ => return None,
        };
        Some(alg)
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size() != 0
    }
}

/// TPM 2.0 Handle Types (top byte of a handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }

    pub fn is_session(self) -> bool {
        matches!(self, TpmHt::HmacSession | TpmHt::PolicySession)
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // Password authorization
    pub const LOCKOUT: u32 = 0x4000000A;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }
}

/// TPM 2.0 Startup Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSu {
    Clear = 0x0000,
    State = 0x0001,
}

/// TPM 2.0 Arithmetic operands for PolicyNV / PolicyCounterTimer (TPM_EO)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEo {
    Eq = 0x0000,
    Neq = 0x0001,
    SignedGt = 0x0002,
    UnsignedGt = 0x0003,
    SignedLt = 0x0004,
    UnsignedLt = 0x0005,
    SignedGe = 0x0006,
    UnsignedGe = 0x0007,
    SignedLe = 0x0008,
    UnsignedLe = 0x0009,
    BitSet = 0x000A,
    BitClear = 0x000B,
}

impl TpmEo {
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const ST_CLEAR: u32 = 1 << 2;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const ADMIN_WITH_POLICY: u32 = 1 << 7;
    pub const NO_DA: u32 = 1 << 10;
    pub const ENCRYPTED_DUPLICATION: u32 = 1 << 11;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with(mut self, bits: u32) -> Self {
        self.0 |= bits;
        self
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// TPM 2.0 NV Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaNv(pub u32);

impl TpmaNv {
    pub const PP_WRITE: u32 = 1 << 0;
    pub const OWNER_WRITE: u32 = 1 << 1;
    pub const AUTH_WRITE: u32 = 1 << 2;
    pub const POLICY_WRITE: u32 = 1 << 3;
    pub const PP_READ: u32 = 1 << 16;
    pub const OWNER_READ: u32 = 1 << 17;
    pub const AUTH_READ: u32 = 1 << 18;
    pub const POLICY_READ: u32 = 1 << 19;
    pub const NO_DA: u32 = 1 << 25;
    pub const WRITTEN: u32 = 1 << 29;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with(mut self, bits: u32) -> Self {
        self.0 |= bits;
        self
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const AUDIT_EXCLUSIVE: u8 = 1 << 1;
    pub const AUDIT_RESET: u8 = 1 << 2;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;
    pub const AUDIT: u8 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_encrypt(mut self) -> Self {
        self.0 |= Self::ENCRYPT;
        self
    }

    pub fn with_audit(mut self) -> Self {
        self.0 |= Self::AUDIT;
        self
    }

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    RspCommand = 0x00C4,
    Null = 0x8000,
    NoSessions = 0x8001,
    Sessions = 0x8002,
    Creation = 0x8021,
    Verified = 0x8022,
    AuthSecret = 0x8023,
    HashCheck = 0x8024,
    AuthSigned = 0x8025,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x00C4 => Some(TpmSt::RspCommand),
            0x8000 => Some(TpmSt::Null),
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x8021 => Some(TpmSt::Creation),
            0x8022 => Some(TpmSt::Verified),
            0x8023 => Some(TpmSt::AuthSecret),
            0x8024 => Some(TpmSt::HashCheck),
            0x8025 => Some(TpmSt::AuthSigned),
            _ => None,
        }
    }
}

/// ECC Curve IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEccCurve {
    None = 0x0000,
    NistP256 = 0x0003,
    NistP384 = 0x0004,
    NistP521 = 0x0005,
}

impl TpmEccCurve {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0000 => Some(TpmEccCurve::None),
            0x0003 => Some(TpmEccCurve::NistP256),
            0x0004 => Some(TpmEccCurve::NistP384),
            0x0005 => Some(TpmEccCurve::NistP521),
            _ => None,
        }
    }
}

//! RDP negotiation handshake and response signatures
//!
//! Sends an X.224 Connection Request carrying an RDP Negotiation Request
//! (TLS | CredSSP | CredSSP-EX) and compares the full reply byte for byte
//! against known server builds.

/// X.224 Connection Request, requested protocols `0x0b`.
pub const RDP_NEGOTIATION_REQUEST: [u8; 19] = [
    0x03, 0x00, 0x00, 0x13, 0x0e, 0xe0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x08, 0x00, 0x0b,
    0x00, 0x00, 0x00,
];

/// A known negotiation reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdpSignature {
    pub response: &'static [u8],
    pub operation_verbose: &'static str,
    pub cpes: &'static [&'static str],
}

static SIGNATURES: &[RdpSignature] = &[
    RdpSignature {
        response: &[
            0x03, 0x00, 0x00, 0x13, 0x0e, 0xd0, 0x00, 0x00, 0x12, 0x34, 0x00, 0x02, 0x1f, 0x08,
            0x00, 0x08, 0x00, 0x00, 0x00,
        ],
        operation_verbose: "Windows 10 / Server 2016 or later",
        cpes: &["cpe:/o:microsoft:windows_10", "cpe:/o:microsoft:windows_server_2016"],
    },
    RdpSignature {
        response: &[
            0x03, 0x00, 0x00, 0x13, 0x0e, 0xd0, 0x00, 0x00, 0x12, 0x34, 0x00, 0x02, 0x0f, 0x08,
            0x00, 0x08, 0x00, 0x00, 0x00,
        ],
        operation_verbose: "Windows 8.1 / Server 2012 R2",
        cpes: &["cpe:/o:microsoft:windows_8.1", "cpe:/o:microsoft:windows_server_2012:r2"],
    },
    RdpSignature {
        response: &[
            0x03, 0x00, 0x00, 0x13, 0x0e, 0xd0, 0x00, 0x00, 0x12, 0x34, 0x00, 0x02, 0x0f, 0x08,
            0x00, 0x02, 0x00, 0x00, 0x00,
        ],
        operation_verbose: "Windows 8 / Server 2012",
        cpes: &["cpe:/o:microsoft:windows_8", "cpe:/o:microsoft:windows_server_2012"],
    },
    RdpSignature {
        response: &[
            0x03, 0x00, 0x00, 0x13, 0x0e, 0xd0, 0x00, 0x00, 0x12, 0x34, 0x00, 0x02, 0x01, 0x08,
            0x00, 0x02, 0x00, 0x00, 0x00,
        ],
        operation_verbose: "Windows 7 / Server 2008 R2",
        cpes: &["cpe:/o:microsoft:windows_7", "cpe:/o:microsoft:windows_server_2008:r2"],
    },
    RdpSignature {
        response: &[
            0x03, 0x00, 0x00, 0x13, 0x0e, 0xd0, 0x00, 0x00, 0x12, 0x34, 0x00, 0x02, 0x00, 0x08,
            0x00, 0x02, 0x00, 0x00, 0x00,
        ],
        operation_verbose: "Windows Vista / Server 2008",
        cpes: &["cpe:/o:microsoft:windows_vista", "cpe:/o:microsoft:windows_server_2008"],
    },
    RdpSignature {
        response: &[0x03, 0x00, 0x00, 0x0b, 0x06, 0xd0, 0x00, 0x00, 0x12, 0x34, 0x00],
        operation_verbose: "Windows XP / Server 2003",
        cpes: &["cpe:/o:microsoft:windows_xp", "cpe:/o:microsoft:windows_server_2003"],
    },
    RdpSignature {
        response: &[
            0x03, 0x00, 0x00, 0x13, 0x0e, 0xd0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x08,
            0x00, 0x01, 0x00, 0x00, 0x00,
        ],
        operation_verbose: "Linux (xrdp)",
        cpes: &["cpe:/a:neutrinolabs:xrdp", "cpe:/o:linux:linux_kernel"],
    },
];

/// Exact-match lookup of a negotiation reply.
#[must_use]
pub fn lookup_rdp_signature(response: &[u8]) -> Option<&'static RdpSignature> {
    SIGNATURES.iter().find(|sig| sig.response == response)
}

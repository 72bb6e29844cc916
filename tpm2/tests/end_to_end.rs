// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! CreatePrimary through the whole stack against a transport that replays
//! canned responses and records what it was sent.

use std::collections::VecDeque;

use tpm2_engine::command::{build_response, error_response, TpmCommand};
use tpm2_engine::*;

#[derive(Default)]
struct CannedTransport {
    responses: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
}

impl Transport for CannedTransport {
    fn transmit(&mut self, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.sent.push(command.to_vec());
        self.responses
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no canned response left"))
    }
}

fn primary_public() -> TpmtPublic {
    let mut public = TpmtPublic::rsa_storage_key();
    public.unique = TpmuPublicId::Rsa(vec![0xA5; 256]);
    public
}

fn create_primary_response(public: &TpmtPublic) -> Vec<u8> {
    let creation_data = TpmsCreationData {
        pcr_select: TpmlPcrSelection::default(),
        pcr_digest: Tpm2bDigest::new(vec![0x11; 32]),
        locality: 0,
        parent_name_alg: TpmAlgId::Null.to_u16(),
        parent_name: Tpm2bName::new(tpm_rh::OWNER.to_be_bytes().to_vec()),
        parent_qualified_name: Tpm2bName::new(tpm_rh::OWNER.to_be_bytes().to_vec()),
        outside_info: Tpm2bData::empty(),
    };
    let ticket = TpmtTicket {
        tag: TpmSt::Creation,
        hierarchy: tpm_rh::OWNER,
        digest: Tpm2bDigest::new(vec![0x22; 32]),
    };

    let mut params = CommandBuffer::new();
    params.put_sized(marshal::SizeWidth::U16, Some(public));
    params.put_sized(marshal::SizeWidth::U16, Some(&creation_data));
    params.put_tpm2b(&[0x33; 32]);
    ticket.marshal(&mut params);
    params.put_tpm2b(&public.name().unwrap());

    let session = TpmsAuthResponse {
        nonce: Vec::new(),
        attributes: TpmaSa::new(),
        hmac: Vec::new(),
    };
    build_response(rc::SUCCESS, &[0x8000_0000], params.as_bytes(), &[session]).unwrap()
}

#[test]
fn test_create_primary_end_to_end() {
    let public = primary_public();
    let mut transport = CannedTransport::default();
    transport
        .responses
        .push_back(create_primary_response(&public));
    let mut ctx = TpmContext::with_transport(transport);

    let result = ctx
        .create_primary(
            &TpmHandle::owner(),
            AuthSpec::null(),
            &TpmsSensitiveCreate::default(),
            &TpmtPublic::rsa_storage_key(),
            &[],
            &TpmlPcrSelection::default(),
        )
        .unwrap();

    // Command side
    let sent = &ctx.transport_mut().sent;
    assert_eq!(sent.len(), 1);
    let raw = &sent[0];
    assert_eq!(&raw[0..2], &[0x80, 0x02]);
    assert_eq!(
        u32::from_be_bytes(raw[2..6].try_into().unwrap()) as usize,
        raw.len()
    );
    assert_eq!(&raw[6..10], &0x0000_0131u32.to_be_bytes());
    assert_eq!(&raw[10..14], &tpm_rh::OWNER.to_be_bytes());
    // Authorization area: size, then TPM_RS_PW with empty nonce,
    // no attributes and an empty password
    assert_eq!(&raw[14..18], &9u32.to_be_bytes());
    assert_eq!(
        &raw[18..27],
        &[0x40, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00, 0x00]
    );

    let command = TpmCommand::parse(raw).unwrap();
    assert_eq!(command.cc, TpmCc::CreatePrimary);
    assert_eq!(command.handles, vec![tpm_rh::OWNER]);
    assert_eq!(command.sessions, vec![TpmsAuthCommand::password(&[])]);
    // Empty TPM2B_SENSITIVE_CREATE carries its two empty members
    assert_eq!(&command.parameters[..6], &[0x00, 0x04, 0, 0, 0, 0]);

    // Response side
    assert_eq!(result.handle.value, 0x8000_0000);
    assert_eq!(result.handle.cached_name(), Some(&public.name().unwrap()[..]));
    assert_eq!(result.public, public);
    let creation_data = result.creation_data.unwrap();
    assert_eq!(creation_data.pcr_digest.buffer, vec![0x11; 32]);
    assert_eq!(result.creation_hash, vec![0x33; 32]);
    assert_eq!(result.creation_ticket.tag, TpmSt::Creation);
    assert_eq!(result.creation_ticket.digest.buffer, vec![0x22; 32]);
}

#[test]
fn test_create_primary_trailing_bytes_rejected() {
    let public = primary_public();
    let mut response = create_primary_response(&public);
    // Grow the parameter area by one byte and fix up both size fields
    let param_size_at = 14;
    let param_size = u32::from_be_bytes(response[param_size_at..param_size_at + 4].try_into().unwrap());
    response[param_size_at..param_size_at + 4].copy_from_slice(&(param_size + 1).to_be_bytes());
    response.insert(18 + param_size as usize, 0xFF);
    let total = response.len() as u32;
    response[2..6].copy_from_slice(&total.to_be_bytes());

    let mut transport = CannedTransport::default();
    transport.responses.push_back(response);
    let mut ctx = TpmContext::with_transport(transport);
    let err = ctx
        .create_primary(
            &TpmHandle::owner(),
            AuthSpec::null(),
            &TpmsSensitiveCreate::default(),
            &TpmtPublic::rsa_storage_key(),
            &[],
            &TpmlPcrSelection::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::TrailingBytes { .. }), "{err}");
}

#[test]
fn test_create_primary_error_code() {
    let mut transport = CannedTransport::default();
    transport.responses.push_back(error_response(0x0000_0902));
    let mut ctx = TpmContext::with_transport(transport);
    let err = ctx
        .create_primary(
            &TpmHandle::owner(),
            AuthSpec::null(),
            &TpmsSensitiveCreate::default(),
            &TpmtPublic::rsa_storage_key(),
            &[],
            &TpmlPcrSelection::default(),
        )
        .unwrap_err();
    assert_eq!(err.response_code(), Some(0x902));
    assert!(matches!(
        err,
        Error::Tpm {
            cc: TpmCc::CreatePrimary,
            ..
        }
    ));
}

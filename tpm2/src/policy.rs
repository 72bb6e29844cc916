// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy trees and their evaluation
//!
//! A [`PolicyTree`] is an arena of immutable assertion nodes. Every node
//! points at the node executed just before it (or, for PolicyOR, at the
//! heads of its branches); the root is executed last. A branch is named by
//! the identifier of its leaf, the first node executed.
//!
//! The same per-node update is used for the offline digest and for the
//! commands sent to the TPM, so a session that ran a branch ends with the
//! digest [`PolicyTree::digest`] predicts.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::commands::{RequestOptions, TpmContext};
use crate::constants::*;
use crate::crypto;
use crate::device::Transport;
use crate::error::{Error, Result};
use crate::handle::TpmHandle;
use crate::marshal::Marshal;
use crate::session::AuthSpec;
use crate::types::*;

/// PolicyOR accepts between two and eight digests
const MIN_OR_BRANCHES: usize = 2;
const MAX_OR_BRANCHES: usize = 8;

/// Index of a node in a [`PolicyTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// One policy assertion
#[derive(Debug, Clone)]
pub enum PolicyAssertion {
    CommandCode(TpmCc),
    Locality(u8),
    Pcr {
        selection: TpmlPcrSelection,
        /// Expected PCR values, in selection order
        values: Vec<Vec<u8>>,
    },
    AuthValue,
    Password,
    CpHash(Vec<u8>),
    NameHash(Vec<u8>),
    CounterTimer {
        operand_b: Vec<u8>,
        offset: u16,
        operation: TpmEo,
    },
    Nv {
        auth_handle: TpmHandle,
        /// Must carry its Name
        nv_index: TpmHandle,
        operand_b: Vec<u8>,
        offset: u16,
        operation: TpmEo,
    },
    Secret {
        /// Entity whose auth value is proven; must carry its Name and Auth
        auth_handle: TpmHandle,
        policy_ref: Vec<u8>,
        cp_hash_a: Vec<u8>,
        expiration: i32,
        include_nonce: bool,
    },
    Signed {
        key: TpmtPublic,
        policy_ref: Vec<u8>,
        cp_hash_a: Vec<u8>,
        expiration: i32,
        include_nonce: bool,
    },
    Ticket {
        timeout: Vec<u8>,
        cp_hash_a: Vec<u8>,
        policy_ref: Vec<u8>,
        auth_name: Vec<u8>,
        ticket: TpmtTkAuth,
    },
    /// Only created through [`PolicyTree::or`]
    Or,
    Authorize {
        approved_policy: Vec<u8>,
        policy_ref: Vec<u8>,
        key: TpmtPublic,
        /// Signature by `key` over H(approvedPolicy || policyRef)
        signature: TpmtSignature,
    },
    AuthorizeNv {
        auth_handle: TpmHandle,
        /// Must carry its Name
        nv_index: TpmHandle,
    },
    DuplicationSelect {
        object_name: Vec<u8>,
        new_parent_name: Vec<u8>,
        include_object: bool,
    },
    PhysicalPresence,
    NvWritten(bool),
    Template(Vec<u8>),
}

/// policyDigest = H(policyDigest || cc || arg2), then
/// policyDigest = H(policyDigest || arg3) when `arg3` is given.
fn policy_update(
    alg: TpmAlgId,
    acc: &mut Vec<u8>,
    cc: TpmCc,
    arg2: &[u8],
    arg3: Option<&[u8]>,
) -> Result<()> {
    *acc = crypto::hash(alg, &[acc.as_slice(), &cc.to_u32().to_be_bytes(), arg2])?;
    if let Some(arg3) = arg3 {
        *acc = crypto::hash(alg, &[acc.as_slice(), arg3])?;
    }
    Ok(())
}

/// H(operandB || offset || operation)
fn operand_args(alg: TpmAlgId, operand_b: &[u8], offset: u16, operation: TpmEo) -> Result<Vec<u8>> {
    crypto::hash(
        alg,
        &[
            operand_b,
            &offset.to_be_bytes(),
            &operation.to_u16().to_be_bytes(),
        ],
    )
}

fn pcr_digest(alg: TpmAlgId, values: &[Vec<u8>]) -> Result<Vec<u8>> {
    let parts: Vec<&[u8]> = values.iter().map(Vec::as_slice).collect();
    crypto::hash(alg, &parts)
}

impl PolicyAssertion {
    /// Fold this assertion into `acc`. PolicyOR is handled by the tree.
    fn update_digest(&self, alg: TpmAlgId, acc: &mut Vec<u8>) -> Result<()> {
        use PolicyAssertion::*;
        match self {
            CommandCode(cc) => policy_update(
                alg,
                acc,
                TpmCc::PolicyCommandCode,
                &cc.to_u32().to_be_bytes(),
                None,
            ),
            Locality(locality) => policy_update(alg, acc, TpmCc::PolicyLocality, &[*locality], None),
            Pcr { selection, values } => {
                let mut arg = selection.to_bytes();
                arg.extend(pcr_digest(alg, values)?);
                policy_update(alg, acc, TpmCc::PolicyPcr, &arg, None)
            }
            // PolicyPassword extends with the PolicyAuthValue command code
            AuthValue | Password => policy_update(alg, acc, TpmCc::PolicyAuthValue, &[], None),
            CpHash(cp) => policy_update(alg, acc, TpmCc::PolicyCpHash, cp, None),
            NameHash(nh) => policy_update(alg, acc, TpmCc::PolicyNameHash, nh, None),
            CounterTimer {
                operand_b,
                offset,
                operation,
            } => {
                let args = operand_args(alg, operand_b, *offset, *operation)?;
                policy_update(alg, acc, TpmCc::PolicyCounterTimer, &args, None)
            }
            Nv {
                nv_index,
                operand_b,
                offset,
                operation,
                ..
            } => {
                let mut arg = operand_args(alg, operand_b, *offset, *operation)?;
                arg.extend(nv_index.name()?);
                policy_update(alg, acc, TpmCc::PolicyNv, &arg, None)
            }
            Secret {
                auth_handle,
                policy_ref,
                ..
            } => policy_update(
                alg,
                acc,
                TpmCc::PolicySecret,
                &auth_handle.name()?,
                Some(policy_ref),
            ),
            Signed {
                key, policy_ref, ..
            } => policy_update(alg, acc, TpmCc::PolicySigned, &key.name()?, Some(policy_ref)),
            Ticket {
                policy_ref,
                auth_name,
                ticket,
                ..
            } => {
                let cc = match ticket.tag {
                    TpmSt::AuthSigned => TpmCc::PolicySigned,
                    TpmSt::AuthSecret => TpmCc::PolicySecret,
                    other => {
                        return Err(Error::InvalidValue {
                            kind: "policy ticket tag",
                            value: other.to_u16() as u32,
                        })
                    }
                };
                policy_update(alg, acc, cc, auth_name, Some(policy_ref))
            }
            Or => Err(Error::logic("PolicyOR digest depends on its branches")),
            Authorize {
                key, policy_ref, ..
            } => {
                *acc = vec![0u8; alg.digest_size()];
                policy_update(alg, acc, TpmCc::PolicyAuthorize, &key.name()?, Some(policy_ref))
            }
            AuthorizeNv { nv_index, .. } => {
                *acc = vec![0u8; alg.digest_size()];
                policy_update(alg, acc, TpmCc::PolicyAuthorizeNv, &nv_index.name()?, None)
            }
            DuplicationSelect {
                object_name,
                new_parent_name,
                include_object,
            } => {
                let mut arg = Vec::new();
                if *include_object {
                    arg.extend_from_slice(object_name);
                }
                arg.extend_from_slice(new_parent_name);
                arg.push(*include_object as u8);
                policy_update(alg, acc, TpmCc::PolicyDuplicationSelect, &arg, None)
            }
            PhysicalPresence => policy_update(alg, acc, TpmCc::PolicyPhysicalPresence, &[], None),
            NvWritten(set) => policy_update(alg, acc, TpmCc::PolicyNvWritten, &[*set as u8], None),
            Template(hash) => policy_update(alg, acc, TpmCc::PolicyTemplate, hash, None),
        }
    }
}

/// What runs before a node
#[derive(Debug, Clone)]
enum Below {
    /// First node of a branch
    Leaf,
    Prev(NodeId),
    /// PolicyOR: the last node of each branch
    Branches(Vec<NodeId>),
}

#[derive(Debug, Clone)]
struct Node {
    assertion: PolicyAssertion,
    branch_id: Option<String>,
    below: Below,
    /// Node executed next; `None` for the root and for nodes not linked yet
    next: Option<NodeId>,
}

/// Arena of policy nodes
#[derive(Debug, Clone, Default)]
pub struct PolicyTree {
    nodes: Vec<Node>,
}

impl PolicyTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| Error::logic(format!("no policy node {}", id.0)))
    }

    fn push(&mut self, assertion: PolicyAssertion, branch_id: Option<String>, below: Below) -> NodeId {
        self.nodes.push(Node {
            assertion,
            branch_id,
            below,
            next: None,
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Claim `id` as the predecessor of the node about to be pushed.
    fn link_below(&mut self, id: NodeId) -> Result<()> {
        if self.node(id)?.next.is_some() {
            return Err(Error::logic(format!("policy node {} is already linked", id.0)));
        }
        Ok(())
    }

    /// Start a branch with its first assertion.
    pub fn leaf(&mut self, branch_id: impl Into<String>, assertion: PolicyAssertion) -> Result<NodeId> {
        let branch_id = branch_id.into();
        if branch_id.is_empty() {
            return Err(Error::logic("empty policy branch identifier"));
        }
        if self.find_leaf(&branch_id).is_some() {
            return Err(Error::logic(format!("duplicate policy branch {branch_id:?}")));
        }
        if matches!(assertion, PolicyAssertion::Or) {
            return Err(Error::logic("PolicyOR cannot start a branch"));
        }
        Ok(self.push(assertion, Some(branch_id), Below::Leaf))
    }

    /// Add an assertion executed right after `prev`.
    pub fn then(&mut self, prev: NodeId, assertion: PolicyAssertion) -> Result<NodeId> {
        if matches!(assertion, PolicyAssertion::Or) {
            return Err(Error::logic("use PolicyTree::or for PolicyOR"));
        }
        self.link_below(prev)?;
        let id = self.push(assertion, None, Below::Prev(prev));
        self.nodes[prev.0].next = Some(id);
        Ok(id)
    }

    /// Add a PolicyOR over branches ending at `branches`.
    pub fn or(&mut self, branches: &[NodeId]) -> Result<NodeId> {
        if !(MIN_OR_BRANCHES..=MAX_OR_BRANCHES).contains(&branches.len()) {
            return Err(Error::logic(format!(
                "PolicyOR needs {MIN_OR_BRANCHES} to {MAX_OR_BRANCHES} branches, got {}",
                branches.len()
            )));
        }
        let distinct: HashSet<_> = branches.iter().collect();
        if distinct.len() != branches.len() {
            return Err(Error::logic("PolicyOR branch listed twice"));
        }
        for &b in branches {
            self.link_below(b)?;
        }
        let id = self.push(PolicyAssertion::Or, None, Below::Branches(branches.to_vec()));
        for &b in branches {
            self.nodes[b.0].next = Some(id);
        }
        Ok(id)
    }

    /// Linear branch; `assertions` are in execution order. Returns the last node.
    pub fn chain(
        &mut self,
        branch_id: impl Into<String>,
        assertions: Vec<PolicyAssertion>,
    ) -> Result<NodeId> {
        let mut iter = assertions.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| Error::logic("empty policy branch"))?;
        let mut id = self.leaf(branch_id, first)?;
        for assertion in iter {
            id = self.then(id, assertion)?;
        }
        Ok(id)
    }

    /// The only node nothing runs after.
    pub fn root(&self) -> Result<NodeId> {
        let mut roots = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].next.is_none())
            .map(NodeId);
        match (roots.next(), roots.next()) {
            (Some(root), None) => Ok(root),
            (None, _) => Err(Error::logic("empty policy tree")),
            (Some(_), Some(_)) => Err(Error::logic("policy tree has more than one root")),
        }
    }

    fn find_leaf(&self, branch_id: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.branch_id.as_deref() == Some(branch_id))
            .map(NodeId)
    }

    pub fn branch_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(|n| n.branch_id.as_deref())
    }

    /// Nodes of a branch in execution order, leaf first and root last.
    pub fn path(&self, branch_id: &str) -> Result<Vec<NodeId>> {
        let mut id = self
            .find_leaf(branch_id)
            .ok_or_else(|| Error::UnknownBranch(branch_id.to_string()))?;
        let mut path = vec![id];
        while let Some(next) = self.node(id)?.next {
            path.push(next);
            id = next;
        }
        Ok(path)
    }

    /// Digest a session holds after running everything up to and including `id`.
    pub fn node_digest(&self, id: NodeId, alg: TpmAlgId) -> Result<Vec<u8>> {
        if !alg.is_hash() {
            return Err(Error::UnsupportedAlgorithm(alg.to_u16()));
        }
        let node = self.node(id)?;
        let mut acc = match &node.below {
            Below::Leaf => vec![0u8; alg.digest_size()],
            Below::Prev(prev) => self.node_digest(*prev, alg)?,
            Below::Branches(branches) => {
                let digests = self.branch_digests(branches, alg)?;
                let mut parts: Vec<&[u8]> = Vec::with_capacity(digests.digests.len() + 2);
                let zero = vec![0u8; alg.digest_size()];
                let cc = TpmCc::PolicyOr.to_u32().to_be_bytes();
                parts.push(&zero);
                parts.push(&cc);
                parts.extend(digests.digests.iter().map(|d| d.buffer.as_slice()));
                return crypto::hash(alg, &parts);
            }
        };
        node.assertion.update_digest(alg, &mut acc)?;
        Ok(acc)
    }

    fn branch_digests(&self, branches: &[NodeId], alg: TpmAlgId) -> Result<TpmlDigest> {
        let digests = branches
            .iter()
            .map(|&b| self.node_digest(b, alg).map(Tpm2bDigest::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(TpmlDigest { digests })
    }

    /// Policy digest of the whole tree (what goes into an object's authPolicy).
    pub fn digest(&self, alg: TpmAlgId) -> Result<Vec<u8>> {
        self.node_digest(self.root()?, alg)
    }
}

/// Caller-supplied operations the evaluator cannot do itself
pub trait PolicyCallbacks {
    /// Sign `a_hash` with the private half of `key` for PolicySigned.
    ///
    /// `a_hash` is digested with the hash of the key's signing scheme, or
    /// with its nameAlg when the scheme is left to the signer.
    fn sign(&mut self, key: &TpmtPublic, a_hash: &[u8]) -> Result<TpmtSignature>;
}

/// For trees without PolicySigned nodes
pub struct NoCallbacks;

impl PolicyCallbacks for NoCallbacks {
    fn sign(&mut self, _key: &TpmtPublic, _a_hash: &[u8]) -> Result<TpmtSignature> {
        Err(Error::logic("PolicySigned needs a signing callback"))
    }
}

/// Where an evaluation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorState {
    Unattached,
    Attached { session: u32 },
    Executed { session: u32, response_code: u32 },
}

/// Runs one branch of a [`PolicyTree`] in a policy session
pub struct PolicyEvaluator<'t> {
    tree: &'t PolicyTree,
    hash_alg: TpmAlgId,
    state: EvaluatorState,
}

impl<'t> PolicyEvaluator<'t> {
    pub fn new(tree: &'t PolicyTree, hash_alg: TpmAlgId) -> Self {
        Self {
            tree,
            hash_alg,
            state: EvaluatorState::Unattached,
        }
    }

    pub fn state(&self) -> EvaluatorState {
        self.state
    }

    /// Digest the session will hold after a successful run.
    pub fn expected_digest(&self) -> Result<Vec<u8>> {
        self.tree.digest(self.hash_alg)
    }

    /// Bind to a started policy (or trial) session.
    pub fn attach(&mut self, session: u32) -> Result<()> {
        if let EvaluatorState::Attached { .. } = self.state {
            return Err(Error::logic("policy evaluator is already attached"));
        }
        if !matches!(TpmHt::of(session), Some(TpmHt::PolicySession)) {
            return Err(Error::logic(format!(
                "{session:#010x} is not a policy session handle"
            )));
        }
        self.state = EvaluatorState::Attached { session };
        Ok(())
    }

    /// Run the branch named `branch_id` from its leaf to the root.
    ///
    /// Stops at the first failing command. With `allow_errors` a TPM error
    /// code is returned as `Ok(code)` instead of an error; success is
    /// `Ok(0)`.
    pub fn execute<T: Transport>(
        &mut self,
        ctx: &mut TpmContext<T>,
        branch_id: &str,
        callbacks: &mut dyn PolicyCallbacks,
        options: RequestOptions,
    ) -> Result<u32> {
        let EvaluatorState::Attached { session } = self.state else {
            return Err(Error::logic("policy evaluator is not attached to a session"));
        };
        let path = self.tree.path(branch_id)?;
        debug!(
            "running policy branch {branch_id:?} ({} nodes) in session {session:#010x}",
            path.len()
        );

        let mut response_code = rc::SUCCESS;
        for id in path {
            match self.run_node(ctx, session, id, callbacks) {
                Ok(()) => {}
                Err(Error::Tpm { rc, .. }) if options.allow_errors => {
                    response_code = rc;
                    break;
                }
                Err(e) => {
                    self.state = EvaluatorState::Executed {
                        session,
                        response_code: e.response_code().unwrap_or(rc::SUCCESS),
                    };
                    return Err(e);
                }
            }
        }
        self.state = EvaluatorState::Executed {
            session,
            response_code,
        };
        Ok(response_code)
    }

    fn nonce_if<T: Transport>(ctx: &TpmContext<T>, session: u32, include: bool) -> Result<Vec<u8>> {
        if !include {
            return Ok(Vec::new());
        }
        ctx.session(session)
            .map(|s| s.nonce_tpm().to_vec())
            .ok_or_else(|| Error::logic(format!("unknown session {session:#010x}")))
    }

    fn run_node<T: Transport>(
        &self,
        ctx: &mut TpmContext<T>,
        session: u32,
        id: NodeId,
        callbacks: &mut dyn PolicyCallbacks,
    ) -> Result<()> {
        use PolicyAssertion::*;
        let node = self.tree.node(id)?;
        match &node.assertion {
            CommandCode(cc) => ctx.policy_command_code(session, *cc),
            Locality(locality) => ctx.policy_locality(session, *locality),
            Pcr { selection, values } => {
                let digest = pcr_digest(self.hash_alg, values)?;
                ctx.policy_pcr(session, &digest, selection)
            }
            AuthValue => ctx.policy_auth_value(session),
            Password => ctx.policy_password(session),
            CpHash(cp) => ctx.policy_cp_hash(session, cp),
            NameHash(nh) => ctx.policy_name_hash(session, nh),
            CounterTimer {
                operand_b,
                offset,
                operation,
            } => ctx.policy_counter_timer(session, operand_b, *offset, *operation),
            Nv {
                auth_handle,
                nv_index,
                operand_b,
                offset,
                operation,
            } => ctx.policy_nv(
                auth_handle,
                AuthSpec::HandleAuth,
                nv_index,
                session,
                operand_b,
                *offset,
                *operation,
            ),
            Secret {
                auth_handle,
                policy_ref,
                cp_hash_a,
                expiration,
                include_nonce,
            } => {
                let nonce = Self::nonce_if(ctx, session, *include_nonce)?;
                ctx.policy_secret(
                    auth_handle,
                    AuthSpec::HandleAuth,
                    session,
                    &nonce,
                    cp_hash_a,
                    policy_ref,
                    *expiration,
                )
                .map(|_| ())
            }
            Signed {
                key,
                policy_ref,
                cp_hash_a,
                expiration,
                include_nonce,
            } => {
                let nonce = Self::nonce_if(ctx, session, *include_nonce)?;
                let a_hash = crypto::hash(
                    signing_hash(key),
                    &[&nonce, &expiration.to_be_bytes(), cp_hash_a, policy_ref],
                )?;
                let signature = callbacks.sign(key, &a_hash)?;
                let handle = ctx.load_external(None, key, tpm_rh::NULL)?;
                let result = ctx.policy_signed(
                    &handle,
                    session,
                    &nonce,
                    cp_hash_a,
                    policy_ref,
                    *expiration,
                    &signature,
                );
                flush_quietly(ctx, handle.value);
                result.map(|_| ())
            }
            Ticket {
                timeout,
                cp_hash_a,
                policy_ref,
                auth_name,
                ticket,
            } => ctx.policy_ticket(session, timeout, cp_hash_a, policy_ref, auth_name, ticket),
            Or => {
                let Below::Branches(branches) = &node.below else {
                    return Err(Error::logic("PolicyOR node without branches"));
                };
                let digests = self.tree.branch_digests(branches, self.hash_alg)?;
                ctx.policy_or(session, &digests)
            }
            Authorize {
                approved_policy,
                policy_ref,
                key,
                signature,
            } => {
                let a_hash = crypto::hash(key.name_alg, &[approved_policy, policy_ref])?;
                let handle = ctx.load_external(None, key, tpm_rh::NULL)?;
                let result = ctx
                    .verify_signature(&handle, &a_hash, signature)
                    .and_then(|ticket| {
                        ctx.policy_authorize(session, approved_policy, policy_ref, &key.name()?, &ticket)
                    });
                flush_quietly(ctx, handle.value);
                result
            }
            AuthorizeNv {
                auth_handle,
                nv_index,
            } => ctx.policy_authorize_nv(auth_handle, AuthSpec::HandleAuth, nv_index, session),
            DuplicationSelect {
                object_name,
                new_parent_name,
                include_object,
            } => ctx.policy_duplication_select(session, object_name, new_parent_name, *include_object),
            PhysicalPresence => ctx.policy_physical_presence(session),
            NvWritten(set) => ctx.policy_nv_written(session, *set),
            Template(hash) => ctx.policy_template(session, hash),
        }
    }
}

/// Hash a PolicySigned authorization is digested with: the signing
/// scheme's, falling back to the key's nameAlg.
fn signing_hash(key: &TpmtPublic) -> TpmAlgId {
    let scheme = match &key.parameters {
        TpmuPublicParms::Rsa(p) => p.scheme,
        TpmuPublicParms::Ecc(p) => p.scheme,
        TpmuPublicParms::KeyedHash(s) => *s,
        TpmuPublicParms::SymCipher(_) => TpmtScheme::Null,
    };
    match scheme {
        TpmtScheme::Hash { hash_alg, .. } | TpmtScheme::EcDaa { hash_alg, .. } => hash_alg,
        _ => key.name_alg,
    }
}

/// Flush a transient key loaded for one assertion. A failure is logged; the
/// assertion's own result stands.
fn flush_quietly<T: Transport>(ctx: &mut TpmContext<T>, handle: u32) {
    if let Err(e) = ctx.flush_context(handle) {
        warn!("failed to flush {handle:#010x}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{build_response, error_response, TpmCommand};
    use crate::marshal::CommandBuffer;
    use crate::session::AuthSession;
    use std::collections::VecDeque;

    const SESSION: u32 = 0x0300_0000;

    #[derive(Default)]
    struct Replay {
        responses: VecDeque<Vec<u8>>,
        sent: Vec<TpmCommand>,
    }

    impl Transport for Replay {
        fn transmit(&mut self, command: &[u8]) -> anyhow::Result<Vec<u8>> {
            self.sent.push(TpmCommand::parse(command)?);
            Ok(self
                .responses
                .pop_front()
                .unwrap_or_else(|| build_response(0, &[], &[], &[]).unwrap()))
        }
    }

    fn context() -> TpmContext<Replay> {
        let mut ctx = TpmContext::with_transport(Replay::default());
        ctx.insert_session(AuthSession::new(
            SESSION,
            TpmSe::Policy,
            TpmAlgId::Sha256,
            TpmtSymDef::Null,
            vec![1; 32],
            vec![2; 32],
        ));
        ctx
    }

    fn two_branch_tree() -> PolicyTree {
        let mut tree = PolicyTree::new();
        let a = tree
            .chain(
                "unseal-with-auth",
                vec![
                    PolicyAssertion::CommandCode(TpmCc::Unseal),
                    PolicyAssertion::AuthValue,
                ],
            )
            .unwrap();
        let b = tree
            .chain("locality-3", vec![PolicyAssertion::Locality(3)])
            .unwrap();
        tree.or(&[a, b]).unwrap();
        tree
    }

    #[test]
    fn test_auth_value_known_digest() {
        let mut tree = PolicyTree::new();
        tree.leaf("only", PolicyAssertion::AuthValue).unwrap();
        assert_eq!(
            hex::encode(tree.digest(TpmAlgId::Sha256).unwrap()),
            "8fcd2169ab92694e0c633f1ab772842b8241bbc20288981fc7ac1eddc1fddb0e"
        );

        let mut password = PolicyTree::new();
        password.leaf("only", PolicyAssertion::Password).unwrap();
        assert_eq!(
            password.digest(TpmAlgId::Sha256).unwrap(),
            tree.digest(TpmAlgId::Sha256).unwrap()
        );
    }

    #[test]
    fn test_chain_digest_is_leaf_first() {
        let mut tree = PolicyTree::new();
        tree.chain(
            "b",
            vec![
                PolicyAssertion::CommandCode(TpmCc::Unseal),
                PolicyAssertion::Locality(1),
            ],
        )
        .unwrap();

        let alg = TpmAlgId::Sha256;
        let zero = [0u8; 32];
        let d1 = crypto::hash(alg, &[&zero, &[0, 0, 1, 0x6C], &[0, 0, 1, 0x5E]]).unwrap();
        let d2 = crypto::hash(alg, &[&d1, &[0, 0, 1, 0x6F], &[1]]).unwrap();
        assert_eq!(tree.digest(alg).unwrap(), d2);
    }

    #[test]
    fn test_or_digest_over_branch_digests() {
        let tree = two_branch_tree();
        let alg = TpmAlgId::Sha256;
        let root = tree.root().unwrap();
        let Below::Branches(branches) = &tree.node(root).unwrap().below else {
            panic!("root is not an OR node");
        };
        let d_a = tree.node_digest(branches[0], alg).unwrap();
        let d_b = tree.node_digest(branches[1], alg).unwrap();
        let expected = crypto::hash(alg, &[&[0u8; 32], &[0, 0, 1, 0x71], &d_a, &d_b]).unwrap();
        assert_eq!(tree.digest(alg).unwrap(), expected);

        // Branch order matters
        let mut swapped = PolicyTree::new();
        let b = swapped.chain("locality-3", vec![PolicyAssertion::Locality(3)]).unwrap();
        let a = swapped
            .chain(
                "unseal-with-auth",
                vec![
                    PolicyAssertion::CommandCode(TpmCc::Unseal),
                    PolicyAssertion::AuthValue,
                ],
            )
            .unwrap();
        swapped.or(&[b, a]).unwrap();
        assert_ne!(swapped.digest(alg).unwrap(), tree.digest(alg).unwrap());
    }

    #[test]
    fn test_authorize_resets_digest() {
        let key = TpmtPublic::ecc_storage_key();
        let authorize = |tree: &mut PolicyTree, prefix: bool| {
            let node = PolicyAssertion::Authorize {
                approved_policy: vec![],
                policy_ref: b"ref".to_vec(),
                key: key.clone(),
                signature: TpmtSignature::Null,
            };
            if prefix {
                let first = tree.leaf("x", PolicyAssertion::PhysicalPresence).unwrap();
                tree.then(first, node).unwrap();
            } else {
                tree.leaf("x", node).unwrap();
            }
        };
        let mut plain = PolicyTree::new();
        authorize(&mut plain, false);
        let mut prefixed = PolicyTree::new();
        authorize(&mut prefixed, true);
        assert_eq!(
            plain.digest(TpmAlgId::Sha256).unwrap(),
            prefixed.digest(TpmAlgId::Sha256).unwrap()
        );
    }

    #[test]
    fn test_tree_shape_is_checked() {
        let mut tree = PolicyTree::new();
        let a = tree.leaf("a", PolicyAssertion::AuthValue).unwrap();
        assert!(tree.leaf("a", PolicyAssertion::AuthValue).is_err());
        assert!(tree.leaf("", PolicyAssertion::AuthValue).is_err());
        assert!(tree.or(&[a]).is_err());
        assert!(tree.or(&[a, a]).is_err());
        let b = tree.leaf("b", PolicyAssertion::PhysicalPresence).unwrap();
        assert!(matches!(tree.root(), Err(Error::Logic(_))));
        tree.or(&[a, b]).unwrap();
        // Linked nodes are frozen
        assert!(tree.then(a, PolicyAssertion::AuthValue).is_err());
        assert!(tree.root().is_ok());
        assert!(matches!(tree.path("c"), Err(Error::UnknownBranch(_))));
    }

    #[test]
    fn test_evaluator_runs_leaf_to_root() {
        let tree = two_branch_tree();
        let mut ctx = context();
        let mut eval = PolicyEvaluator::new(&tree, TpmAlgId::Sha256);
        assert!(eval
            .execute(&mut ctx, "locality-3", &mut NoCallbacks, RequestOptions::default())
            .is_err());
        eval.attach(SESSION).unwrap();

        let rc = eval
            .execute(&mut ctx, "unseal-with-auth", &mut NoCallbacks, RequestOptions::default())
            .unwrap();
        assert_eq!(rc, 0);
        assert_eq!(
            eval.state(),
            EvaluatorState::Executed {
                session: SESSION,
                response_code: 0
            }
        );

        let sent = &ctx.transport_mut().sent;
        let codes: Vec<TpmCc> = sent.iter().map(|c| c.cc).collect();
        assert_eq!(
            codes,
            vec![TpmCc::PolicyCommandCode, TpmCc::PolicyAuthValue, TpmCc::PolicyOr]
        );
        let or = &sent[2];
        assert_eq!(or.handles, vec![SESSION]);
        let Below::Branches(branches) = &tree.node(tree.root().unwrap()).unwrap().below else {
            panic!("root is not an OR node");
        };
        let expected = tree.branch_digests(branches, TpmAlgId::Sha256).unwrap();
        assert_eq!(or.parameters, expected.to_bytes());

        assert!(ctx.session(SESSION).unwrap().needs_hmac());
    }

    #[test]
    fn test_evaluator_stops_at_first_failure() {
        let tree = two_branch_tree();
        let policy_fail = 0x0000_099D;

        let mut ctx = context();
        ctx.transport_mut().responses.push_back(error_response(policy_fail));
        let mut eval = PolicyEvaluator::new(&tree, TpmAlgId::Sha256);
        eval.attach(SESSION).unwrap();
        let err = eval
            .execute(&mut ctx, "unseal-with-auth", &mut NoCallbacks, RequestOptions::default())
            .unwrap_err();
        assert_eq!(err.response_code(), Some(policy_fail));
        assert_eq!(ctx.transport_mut().sent.len(), 1);

        let mut ctx = context();
        ctx.transport_mut().responses.push_back(error_response(policy_fail));
        let mut eval = PolicyEvaluator::new(&tree, TpmAlgId::Sha256);
        eval.attach(SESSION).unwrap();
        let rc = eval
            .execute(&mut ctx, "unseal-with-auth", &mut NoCallbacks, RequestOptions::allow_errors())
            .unwrap();
        assert_eq!(rc, policy_fail);
        assert_eq!(ctx.transport_mut().sent.len(), 1);

        assert!(matches!(
            eval.execute(&mut ctx, "nope", &mut NoCallbacks, RequestOptions::default()),
            Err(Error::Logic(_))
        ));
    }

    struct RecordingSigner {
        a_hash: Vec<u8>,
    }

    impl PolicyCallbacks for RecordingSigner {
        fn sign(&mut self, _key: &TpmtPublic, a_hash: &[u8]) -> Result<TpmtSignature> {
            self.a_hash = a_hash.to_vec();
            Ok(TpmtSignature::Rsa {
                scheme: TpmAlgId::RsaSsa,
                hash_alg: TpmAlgId::Sha384,
                sig: vec![0x5A; 256],
            })
        }
    }

    /// SHA-256 named RSA key that signs with RSASSA-SHA384
    fn signing_key() -> TpmtPublic {
        TpmtPublic {
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with(TpmaObject::SIGN_ENCRYPT | TpmaObject::USER_WITH_AUTH),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmuPublicParms::Rsa(TpmsRsaParms {
                symmetric: TpmtSymDef::Null,
                scheme: TpmtScheme::hash(TpmAlgId::RsaSsa, TpmAlgId::Sha384),
                key_bits: 2048,
                exponent: 0,
            }),
            unique: TpmuPublicId::Rsa(vec![0xC3; 256]),
        }
    }

    fn signed_tree() -> PolicyTree {
        let mut tree = PolicyTree::new();
        tree.leaf(
            "signed",
            PolicyAssertion::Signed {
                key: signing_key(),
                policy_ref: b"ref".to_vec(),
                cp_hash_a: Vec::new(),
                expiration: 0,
                include_nonce: false,
            },
        )
        .unwrap();
        tree
    }

    fn load_external_response() -> Vec<u8> {
        let name = signing_key().name().unwrap();
        let mut params = CommandBuffer::new();
        params.put_tpm2b(&name);
        build_response(0, &[0x8000_0001], params.as_bytes(), &[]).unwrap()
    }

    fn policy_signed_response() -> Vec<u8> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(&[]);
        TpmtTicket {
            tag: TpmSt::AuthSigned,
            hierarchy: tpm_rh::NULL,
            digest: Tpm2bDigest::empty(),
        }
        .marshal(&mut params);
        build_response(0, &[], params.as_bytes(), &[]).unwrap()
    }

    #[test]
    fn test_signed_a_hash_uses_scheme_hash() {
        let tree = signed_tree();
        let mut ctx = context();
        let responses = &mut ctx.transport_mut().responses;
        responses.push_back(load_external_response());
        responses.push_back(policy_signed_response());
        let mut eval = PolicyEvaluator::new(&tree, TpmAlgId::Sha256);
        eval.attach(SESSION).unwrap();
        let mut signer = RecordingSigner { a_hash: Vec::new() };
        eval.execute(&mut ctx, "signed", &mut signer, RequestOptions::default())
            .unwrap();

        let empty: &[u8] = &[];
        let expected = crypto::hash(
            TpmAlgId::Sha384,
            &[empty, &0i32.to_be_bytes(), empty, b"ref"],
        )
        .unwrap();
        assert_eq!(signer.a_hash.len(), 48);
        assert_eq!(signer.a_hash, expected);
    }

    #[test]
    fn test_flush_failure_keeps_policy_result() {
        let tree = signed_tree();
        let mut ctx = context();
        let responses = &mut ctx.transport_mut().responses;
        responses.push_back(load_external_response());
        responses.push_back(policy_signed_response());
        responses.push_back(error_response(0x0000_018B));
        let mut eval = PolicyEvaluator::new(&tree, TpmAlgId::Sha256);
        eval.attach(SESSION).unwrap();
        let mut signer = RecordingSigner { a_hash: Vec::new() };
        let rc = eval
            .execute(&mut ctx, "signed", &mut signer, RequestOptions::default())
            .unwrap();
        assert_eq!(rc, 0);
        let codes: Vec<TpmCc> = ctx.transport_mut().sent.iter().map(|c| c.cc).collect();
        assert_eq!(
            codes,
            vec![TpmCc::LoadExternal, TpmCc::PolicySigned, TpmCc::FlushContext]
        );

        // A failing assertion still flushes, and its error is the one reported
        let policy_fail = 0x0000_099D;
        let mut ctx = context();
        let responses = &mut ctx.transport_mut().responses;
        responses.push_back(load_external_response());
        responses.push_back(error_response(policy_fail));
        responses.push_back(error_response(0x0000_018B));
        let mut eval = PolicyEvaluator::new(&tree, TpmAlgId::Sha256);
        eval.attach(SESSION).unwrap();
        let err = eval
            .execute(&mut ctx, "signed", &mut signer, RequestOptions::default())
            .unwrap_err();
        assert_eq!(err.response_code(), Some(policy_fail));
        assert_eq!(ctx.transport_mut().sent.len(), 3);
    }

    #[test]
    fn test_unknown_branch() {
        let tree = two_branch_tree();
        let mut ctx = context();
        let mut eval = PolicyEvaluator::new(&tree, TpmAlgId::Sha256);
        eval.attach(SESSION).unwrap();
        assert!(matches!(
            eval.execute(&mut ctx, "nope", &mut NoCallbacks, RequestOptions::default()),
            Err(Error::UnknownBranch(_))
        ));
        assert!(ctx.transport_mut().sent.is_empty());
    }
}

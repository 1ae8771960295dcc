//! Shared test fixtures: an in-process fake mint with real mint-side
//! signing, and helpers to assemble a wallet core around it.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bip39::Mnemonic;
use cashu::dhke::sign_message;
use cashu::nuts::nut07::{ProofState as MintProofState, State as MintState};
use cashu::nuts::{
    BlindSignature, BlindedMessage, CurrencyUnit, Id, Keys, Proof, Proofs, PublicKey,
    RestoreResponse, SecretKey, SwapRequest, SwapResponse,
};
use cashu::Amount;
use satchel::database::{MemoryStore, WalletStorage};
use satchel::transport::http::{
    KeysetEntry, MeltQuoteResponse, MintClient, MintQuoteResponse,
};
use satchel::{Error, MintUrl, WalletCore, WalletCoreBuilder};
use satchel_common::quotes::{MeltQuoteState, MintQuoteState};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Mutex;

pub const MINT_URL: &str = "https://mint.test.example.com";

pub fn mint_url() -> MintUrl {
    MintUrl::from_str(MINT_URL).unwrap()
}

pub fn unit() -> CurrencyUnit {
    CurrencyUnit::Sat
}

pub fn test_seed() -> [u8; 64] {
    Mnemonic::from_str(
        "half depart obvious quality work element tank gorilla view sugar picture humble",
    )
    .unwrap()
    .to_seed("")
}

/// How the fake mint settles melt requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeltBehavior {
    Paid,
    Pending,
    Unpaid,
}

#[derive(Debug, Clone)]
struct FakeMeltQuote {
    amount: Amount,
    fee_reserve: Amount,
    state: MeltQuoteState,
    preimage: Option<String>,
    change: Option<Vec<BlindSignature>>,
}

#[derive(Debug)]
struct FakeMintState {
    spent: HashSet<PublicKey>,
    pending: HashSet<PublicKey>,
    /// Every blinded message the mint ever signed, by B'.
    signed: HashMap<PublicKey, BlindSignature>,
    mint_quotes: HashMap<String, (Amount, MintQuoteState)>,
    melt_quotes: HashMap<String, FakeMeltQuote>,
    quote_counter: u64,
    melt_behavior: MeltBehavior,
    next_melt_quote: (Amount, Amount),
    unreachable: bool,
}

/// An in-process Cashu mint good enough for the wallet's protocols:
/// real blind signatures, spent-state tracking, restore.
#[derive(Debug, Clone)]
pub struct FakeMint {
    keyset_id: Id,
    secret_keys: BTreeMap<u64, SecretKey>,
    keys: BTreeMap<u64, PublicKey>,
    input_fee_ppk: u64,
    state: Arc<Mutex<FakeMintState>>,
}

// SwapRequest accessors go through serde so the fake mint does not
// depend on the struct's field visibility.
#[derive(Debug, Deserialize)]
struct WireSwapRequest {
    inputs: Proofs,
    outputs: Vec<BlindedMessage>,
}

impl FakeMint {
    pub fn new(input_fee_ppk: u64) -> Self {
        let mut secret_keys = BTreeMap::new();
        let mut keys = BTreeMap::new();
        for bit in 0..16u32 {
            let amount = 1u64 << bit;
            let sk = SecretKey::generate();
            keys.insert(amount, sk.public_key());
            secret_keys.insert(amount, sk);
        }

        let keyset_id = Id::v1_from_keys(&Keys::new(
            keys.iter()
                .map(|(amount, pk)| (Amount::from(*amount), *pk))
                .collect(),
        ));

        Self {
            keyset_id,
            secret_keys,
            keys,
            input_fee_ppk,
            state: Arc::new(Mutex::new(FakeMintState {
                spent: HashSet::new(),
                pending: HashSet::new(),
                signed: HashMap::new(),
                mint_quotes: HashMap::new(),
                melt_quotes: HashMap::new(),
                quote_counter: 0,
                melt_behavior: MeltBehavior::Paid,
                next_melt_quote: (Amount::from(100), Amount::from(10)),
                unreachable: false,
            })),
        }
    }

    pub fn keyset_id(&self) -> Id {
        self.keyset_id
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn set_melt_behavior(&self, behavior: MeltBehavior) {
        self.state.lock().unwrap().melt_behavior = behavior;
    }

    /// Configure the amount and fee reserve of the next melt quote.
    pub fn set_next_melt_quote(&self, amount: u64, fee_reserve: u64) {
        self.state.lock().unwrap().next_melt_quote =
            (Amount::from(amount), Amount::from(fee_reserve));
    }

    /// Simulate the invoice of a mint quote being paid.
    pub fn pay_mint_quote(&self, quote_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some((_, quote_state)) = state.mint_quotes.get_mut(quote_id) {
            *quote_state = MintQuoteState::Paid;
        }
    }

    /// Simulate a recipient claiming proofs: their Ys become spent.
    pub fn claim(&self, proofs: &Proofs) {
        let mut state = self.state.lock().unwrap();
        for proof in proofs {
            state.spent.insert(proof.y().unwrap());
        }
    }

    pub fn is_spent(&self, proof: &Proof) -> bool {
        self.state
            .lock()
            .unwrap()
            .spent
            .contains(&proof.y().unwrap())
    }

    fn guard(&self) -> Result<(), Error> {
        if self.state.lock().unwrap().unreachable {
            return Err(Error::Network("fake mint unreachable".to_string()));
        }
        Ok(())
    }

    fn sign(&self, output: &BlindedMessage, amount: Amount) -> BlindSignature {
        let sk = self
            .secret_keys
            .get(&u64::from(amount))
            .expect("fake mint has keys for all powers of two");
        let c = sign_message(sk, &output.blinded_secret).expect("signing cannot fail");

        let signature = BlindSignature {
            amount,
            keyset_id: self.keyset_id,
            c,
            dleq: None,
        };

        self.state
            .lock()
            .unwrap()
            .signed
            .insert(output.blinded_secret, signature.clone());
        signature
    }

    fn fee_for(&self, input_count: usize) -> u64 {
        (self.input_fee_ppk * input_count as u64).div_ceil(1000)
    }

    /// Spend checks and state flips shared by swap and melt.
    fn consume_inputs(&self, inputs: &Proofs) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        for proof in inputs {
            let y = proof.y().unwrap();
            if state.spent.contains(&y) {
                return Err(Error::MintOperation {
                    code: 11001,
                    detail: "Token already spent".to_string(),
                    status: 400,
                });
            }
            state.spent.insert(y);
        }
        Ok(())
    }
}

#[async_trait]
impl MintClient for FakeMint {
    async fn get_mint_info(&self, _mint_url: &MintUrl) -> Result<Value, Error> {
        self.guard()?;
        Ok(json!({ "name": "fake mint", "version": "fake/0.1.0" }))
    }

    async fn get_keysets(&self, _mint_url: &MintUrl) -> Result<Vec<KeysetEntry>, Error> {
        self.guard()?;
        Ok(vec![KeysetEntry {
            id: self.keyset_id,
            unit: CurrencyUnit::Sat,
            active: true,
            input_fee_ppk: self.input_fee_ppk,
        }])
    }

    async fn get_keyset_keys(
        &self,
        _mint_url: &MintUrl,
        keyset_id: Id,
    ) -> Result<BTreeMap<u64, PublicKey>, Error> {
        self.guard()?;
        if keyset_id != self.keyset_id {
            return Err(Error::MintOperation {
                code: 12001,
                detail: "Keyset not found".to_string(),
                status: 400,
            });
        }
        Ok(self.keys.clone())
    }

    async fn create_mint_quote(
        &self,
        _mint_url: &MintUrl,
        amount: Amount,
        _unit: CurrencyUnit,
    ) -> Result<MintQuoteResponse, Error> {
        self.guard()?;
        let mut state = self.state.lock().unwrap();
        state.quote_counter += 1;
        let quote_id = format!("mint-quote-{}", state.quote_counter);
        state
            .mint_quotes
            .insert(quote_id.clone(), (amount, MintQuoteState::Unpaid));

        Ok(MintQuoteResponse {
            quote: quote_id.clone(),
            request: format!("lnbc-fake-{quote_id}"),
            state: MintQuoteState::Unpaid,
            expiry: 0,
        })
    }

    async fn get_mint_quote(
        &self,
        _mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MintQuoteResponse, Error> {
        self.guard()?;
        let state = self.state.lock().unwrap();
        let (_, quote_state) = state.mint_quotes.get(quote_id).ok_or_else(|| {
            Error::MintOperation {
                code: 20005,
                detail: "Quote not found".to_string(),
                status: 400,
            }
        })?;

        Ok(MintQuoteResponse {
            quote: quote_id.to_string(),
            request: format!("lnbc-fake-{quote_id}"),
            state: *quote_state,
            expiry: 0,
        })
    }

    async fn mint(
        &self,
        _mint_url: &MintUrl,
        quote_id: &str,
        outputs: Vec<BlindedMessage>,
    ) -> Result<Vec<BlindSignature>, Error> {
        self.guard()?;
        {
            let mut state = self.state.lock().unwrap();
            match state.mint_quotes.get_mut(quote_id) {
                Some((amount, quote_state)) if *quote_state == MintQuoteState::Paid => {
                    let requested: u64 = outputs.iter().map(|o| u64::from(o.amount)).sum();
                    if requested != u64::from(*amount) {
                        return Err(Error::MintOperation {
                            code: 20002,
                            detail: "Output amount does not match quote".to_string(),
                            status: 400,
                        });
                    }
                    *quote_state = MintQuoteState::Issued;
                }
                Some(_) => {
                    return Err(Error::MintOperation {
                        code: 20001,
                        detail: "Quote not paid".to_string(),
                        status: 400,
                    })
                }
                None => {
                    return Err(Error::MintOperation {
                        code: 20005,
                        detail: "Quote not found".to_string(),
                        status: 400,
                    })
                }
            }
        }

        Ok(outputs
            .iter()
            .map(|output| self.sign(output, output.amount))
            .collect())
    }

    async fn create_melt_quote(
        &self,
        _mint_url: &MintUrl,
        _request: String,
        _unit: CurrencyUnit,
    ) -> Result<MeltQuoteResponse, Error> {
        self.guard()?;
        let mut state = self.state.lock().unwrap();
        state.quote_counter += 1;
        let quote_id = format!("melt-quote-{}", state.quote_counter);
        let (amount, fee_reserve) = state.next_melt_quote;
        state.melt_quotes.insert(
            quote_id.clone(),
            FakeMeltQuote {
                amount,
                fee_reserve,
                state: MeltQuoteState::Unpaid,
                preimage: None,
                change: None,
            },
        );

        Ok(MeltQuoteResponse {
            quote: quote_id,
            amount,
            fee_reserve,
            state: MeltQuoteState::Unpaid,
            expiry: 0,
            payment_preimage: None,
            change: None,
        })
    }

    async fn get_melt_quote(
        &self,
        _mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MeltQuoteResponse, Error> {
        self.guard()?;
        let state = self.state.lock().unwrap();
        let quote = state.melt_quotes.get(quote_id).ok_or_else(|| {
            Error::MintOperation {
                code: 20005,
                detail: "Quote not found".to_string(),
                status: 400,
            }
        })?;

        Ok(MeltQuoteResponse {
            quote: quote_id.to_string(),
            amount: quote.amount,
            fee_reserve: quote.fee_reserve,
            state: quote.state,
            expiry: 0,
            payment_preimage: quote.preimage.clone(),
            change: quote.change.clone(),
        })
    }

    async fn melt(
        &self,
        _mint_url: &MintUrl,
        quote_id: &str,
        inputs: Proofs,
        outputs: Vec<BlindedMessage>,
    ) -> Result<MeltQuoteResponse, Error> {
        self.guard()?;

        let (behavior, amount, fee_reserve) = {
            let state = self.state.lock().unwrap();
            let quote = state.melt_quotes.get(quote_id).ok_or_else(|| {
                Error::MintOperation {
                    code: 20005,
                    detail: "Quote not found".to_string(),
                    status: 400,
                }
            })?;
            (state.melt_behavior, quote.amount, quote.fee_reserve)
        };

        let inputs_total: u64 = inputs.iter().map(|p| u64::from(p.amount)).sum();
        if inputs_total < u64::from(amount) {
            return Err(Error::MintOperation {
                code: 20003,
                detail: "Inputs below quote amount".to_string(),
                status: 400,
            });
        }

        match behavior {
            MeltBehavior::Unpaid => Ok(MeltQuoteResponse {
                quote: quote_id.to_string(),
                amount,
                fee_reserve,
                state: MeltQuoteState::Unpaid,
                expiry: 0,
                payment_preimage: None,
                change: None,
            }),
            MeltBehavior::Pending => {
                let mut state = self.state.lock().unwrap();
                for proof in &inputs {
                    state.pending.insert(proof.y().unwrap());
                }
                if let Some(quote) = state.melt_quotes.get_mut(quote_id) {
                    quote.state = MeltQuoteState::Pending;
                }
                Ok(MeltQuoteResponse {
                    quote: quote_id.to_string(),
                    amount,
                    fee_reserve,
                    state: MeltQuoteState::Pending,
                    expiry: 0,
                    payment_preimage: None,
                    change: None,
                })
            }
            MeltBehavior::Paid => {
                self.consume_inputs(&inputs)?;

                // The fake Lightning payment costs nothing, so all of
                // the overpayment comes back as change.
                let change_amount = Amount::from(inputs_total - u64::from(amount));
                let mut change = Vec::new();
                let parts = change_amount.split();
                for (output, part) in outputs.iter().zip(parts) {
                    change.push(self.sign(output, part));
                }

                let preimage = Some(format!("preimage-{quote_id}"));
                {
                    let mut state = self.state.lock().unwrap();
                    if let Some(quote) = state.melt_quotes.get_mut(quote_id) {
                        quote.state = MeltQuoteState::Paid;
                        quote.preimage = preimage.clone();
                        quote.change = Some(change.clone());
                    }
                }

                Ok(MeltQuoteResponse {
                    quote: quote_id.to_string(),
                    amount,
                    fee_reserve,
                    state: MeltQuoteState::Paid,
                    expiry: 0,
                    payment_preimage: preimage,
                    change: Some(change),
                })
            }
        }
    }

    async fn swap(
        &self,
        _mint_url: &MintUrl,
        request: SwapRequest,
    ) -> Result<SwapResponse, Error> {
        self.guard()?;

        let wire: WireSwapRequest = serde_json::from_value(serde_json::to_value(&request)?)?;

        let inputs_total: u64 = wire.inputs.iter().map(|p| u64::from(p.amount)).sum();
        let outputs_total: u64 = wire.outputs.iter().map(|o| u64::from(o.amount)).sum();
        let fee = self.fee_for(wire.inputs.len());

        if inputs_total != outputs_total + fee {
            return Err(Error::MintOperation {
                code: 11002,
                detail: format!(
                    "Transaction unbalanced: {inputs_total} != {outputs_total} + {fee}"
                ),
                status: 400,
            });
        }

        self.consume_inputs(&wire.inputs)?;

        let signatures = wire
            .outputs
            .iter()
            .map(|output| self.sign(output, output.amount))
            .collect();

        Ok(SwapResponse { signatures })
    }

    async fn check_state(
        &self,
        _mint_url: &MintUrl,
        ys: Vec<PublicKey>,
    ) -> Result<Vec<MintProofState>, Error> {
        self.guard()?;
        let state = self.state.lock().unwrap();
        Ok(ys
            .into_iter()
            .map(|y| {
                let mint_state = if state.spent.contains(&y) {
                    MintState::Spent
                } else if state.pending.contains(&y) {
                    MintState::Pending
                } else {
                    MintState::Unspent
                };
                MintProofState::from((y, mint_state))
            })
            .collect())
    }

    async fn restore(
        &self,
        _mint_url: &MintUrl,
        outputs: Vec<BlindedMessage>,
    ) -> Result<RestoreResponse, Error> {
        self.guard()?;
        let state = self.state.lock().unwrap();

        let mut returned_outputs = Vec::new();
        let mut signatures = Vec::new();
        for output in outputs {
            if let Some(signature) = state.signed.get(&output.blinded_secret) {
                returned_outputs.push(output);
                signatures.push(signature.clone());
            }
        }

        // Built through serde to stay independent of optional legacy
        // fields on the response struct.
        Ok(serde_json::from_value(json!({
            "outputs": returned_outputs,
            "signatures": signatures,
        }))?)
    }
}

/// A wallet core wired to a fake mint over in-memory storage.
pub struct TestHarness {
    pub core: WalletCore,
    pub mint: FakeMint,
    pub storage: Arc<MemoryStore>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_fee(0).await
    }

    pub async fn with_fee(input_fee_ppk: u64) -> Self {
        let storage = Arc::new(MemoryStore::new());
        let mint = FakeMint::new(input_fee_ppk);

        let core = WalletCoreBuilder::new()
            .storage(storage.clone() as Arc<dyn WalletStorage>)
            .seed(test_seed())
            .client(mint.clone())
            .build()
            .unwrap();

        core.add_mint(MINT_URL, true).await.unwrap();

        Self {
            core,
            mint,
            storage,
        }
    }

    /// Rebuild the core on the same storage and mint, as a process
    /// restart would.
    pub fn restart(&self) -> WalletCore {
        WalletCoreBuilder::new()
            .storage(self.storage.clone() as Arc<dyn WalletStorage>)
            .seed(test_seed())
            .client(self.mint.clone())
            .build()
            .unwrap()
    }

    /// Fund the wallet by minting against a paid quote.
    pub async fn fund(&self, amount: u64) -> Amount {
        let quote = self
            .core
            .mint_quote(&mint_url(), &unit(), Amount::from(amount))
            .await
            .unwrap();
        self.mint.pay_mint_quote(&quote.id);
        self.core
            .redeem_mint_quote(&mint_url(), &quote.id)
            .await
            .unwrap()
    }
}

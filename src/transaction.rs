//! Value transactions as the bridge sees them.
//!
//! A transaction spends a set of existing outputs and creates one group of
//! balances per target address. Signing covers the essence bytes (inputs and
//! outputs); a transaction is fully signed when every distinct input address
//! is covered by a verifying signature.

use crate::types::{Address, Balance, Color, OutputId, TxId};
use crate::wire::{io, WireError, WireResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

#[derive(Clone, Debug)]
pub struct TxSignature {
    pub public_key: VerifyingKey,
    pub signature: Signature,
}

#[derive(Clone, Debug)]
pub struct Transaction {
    inputs: Vec<OutputId>,
    outputs: Vec<(Address, Vec<Balance>)>,
    signatures: Vec<TxSignature>,
}

impl Transaction {
    /// Build an unsigned transaction. Output order is preserved; one entry
    /// per address.
    pub fn new(inputs: Vec<OutputId>, outputs: Vec<(Address, Vec<Balance>)>) -> Self {
        Transaction {
            inputs,
            outputs,
            signatures: Vec::new(),
        }
    }

    pub fn inputs(&self) -> &[OutputId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(Address, Vec<Balance>)] {
        &self.outputs
    }

    pub fn output_balances(&self, addr: &Address) -> Option<&[Balance]> {
        self.outputs
            .iter()
            .find(|(a, _)| a == addr)
            .map(|(_, bals)| bals.as_slice())
    }

    pub fn output_addresses(&self) -> impl Iterator<Item = &Address> {
        self.outputs.iter().map(|(a, _)| a)
    }

    /// Transaction id: blake3 over the fully serialized transaction,
    /// signatures included.
    pub fn id(&self) -> TxId {
        TxId(*blake3::hash(&self.to_bytes()).as_bytes())
    }

    /// The byte string covered by signatures: inputs and outputs only.
    pub fn essence_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_essence(&mut buf);
        buf
    }

    /// Append a signature made with `key` over the essence bytes.
    pub fn sign(&mut self, key: &SigningKey) {
        let essence = self.essence_bytes();
        self.signatures.push(TxSignature {
            public_key: key.verifying_key(),
            signature: key.sign(&essence),
        });
    }

    /// True when every distinct input address is covered by a valid
    /// signature from the key it was derived from.
    pub fn signatures_valid(&self) -> bool {
        let essence = self.essence_bytes();
        self.inputs.iter().all(|input| {
            self.signatures.iter().any(|sig| {
                Address::from_public_key(&sig.public_key) == input.address
                    && sig.public_key.verify(&essence, &sig.signature).is_ok()
            })
        })
    }

    fn write_essence(&self, buf: &mut Vec<u8>) {
        io::write_u16(buf, self.inputs.len() as u16);
        for input in &self.inputs {
            io::write_address(buf, &input.address);
            io::write_txid(buf, &input.txid);
        }
        io::write_u16(buf, self.outputs.len() as u16);
        for (addr, balances) in &self.outputs {
            io::write_address(buf, addr);
            io::write_u16(buf, balances.len() as u16);
            for b in balances {
                io::write_color(buf, &b.color);
                io::write_u64(buf, b.value as u64);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_essence(&mut buf);
        io::write_u16(&mut buf, self.signatures.len() as u16);
        for sig in &self.signatures {
            buf.extend_from_slice(sig.public_key.as_bytes());
            buf.extend_from_slice(&sig.signature.to_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> WireResult<Self> {
        let mut r = data;
        let tx = Self::read(&mut r)?;
        io::expect_end(r)?;
        Ok(tx)
    }

    fn read(r: &mut &[u8]) -> WireResult<Self> {
        let num_inputs = io::read_u16(r)?;
        let mut inputs = Vec::with_capacity(num_inputs as usize);
        for _ in 0..num_inputs {
            let address = io::read_address(r)?;
            let txid = io::read_txid(r)?;
            inputs.push(OutputId::new(address, txid));
        }

        let num_outputs = io::read_u16(r)?;
        let mut outputs = Vec::with_capacity(num_outputs as usize);
        for _ in 0..num_outputs {
            let address = io::read_address(r)?;
            let num_balances = io::read_u16(r)?;
            let mut balances = Vec::with_capacity(num_balances as usize);
            for _ in 0..num_balances {
                let color = io::read_color(r)?;
                let value = io::read_u64(r)?;
                if value > i64::MAX as u64 {
                    return Err(WireError::InvalidBalances("balance value overflows i64"));
                }
                balances.push(Balance::new(color, value as i64));
            }
            outputs.push((address, balances));
        }

        let num_signatures = io::read_u16(r)?;
        let mut signatures = Vec::with_capacity(num_signatures as usize);
        for _ in 0..num_signatures {
            let key_bytes = io::read_array::<32>(r)?;
            let public_key =
                VerifyingKey::from_bytes(&key_bytes).map_err(|_| WireError::BadPublicKey)?;
            let sig_bytes = io::read_array::<64>(r)?;
            signatures.push(TxSignature {
                public_key,
                signature: Signature::from_bytes(&sig_bytes),
            });
        }

        Ok(Transaction {
            inputs,
            outputs,
            signatures,
        })
    }

    /// Sum of output values grouped by color.
    pub fn output_totals_by_color(&self) -> std::collections::HashMap<Color, i64> {
        let mut totals = std::collections::HashMap::new();
        for (_, balances) in &self.outputs {
            for b in balances {
                *totals.entry(b.color).or_insert(0) += b.value;
            }
        }
        totals
    }
}

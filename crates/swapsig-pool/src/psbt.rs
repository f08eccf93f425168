//! Setup and settlement transaction construction (§4.5, §4.6). Mirrors the
//! unsigned-PSBT-building shape used for key-path Taproot spends elsewhere in
//! this workspace: build a `Transaction`, wrap it in `Psbt::from_unsigned_tx`,
//! then populate each input's witness UTXO and Taproot fields.

use bitcoin::absolute::LockTime;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::psbt::Psbt;
use bitcoin::script::Builder as ScriptBuilder;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::transaction::{Transaction, TxIn, Version};
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Sequence, TxOut, Txid, Witness};
use std::str::FromStr;
use swapsig_core::{BurnConfig, Digest32};
use thiserror::Error;

use crate::model::UtxoInput;

const DUST_LIMIT_SATS: u64 = 546;

#[derive(Error, Debug)]
pub enum PsbtError {
    #[error("malformed input txid: {0}")]
    BadTxid(String),
    #[error("setup output {value} sat is below dust limit ({DUST_LIMIT_SATS} sat)")]
    DustOutput { value: u64 },
    #[error("fee and denomination exceed input value {input} < {required}")]
    InsufficientInput { input: u64, required: u64 },
}

/// Build the provably-unspendable burn output script: `OP_RETURN burnIdentifier
/// [poolId] version`, per §4.6.
pub fn build_burn_script(burn_config: &BurnConfig, pool_id: Digest32) -> ScriptBuf {
    let mut builder = ScriptBuilder::new()
        .push_opcode(OP_RETURN)
        .push_slice(&burn_config.burn_identifier);
    if burn_config.pool_id_in_burn {
        builder = builder.push_slice(pool_id.as_bytes());
    }
    builder = builder.push_slice(&[burn_config.version]);
    builder.into_script()
}

/// One participant's unsigned setup transaction: spends their pledged UTXO
/// into their group's Taproot output, a burn output, and optional change.
pub fn build_setup_psbt(
    input: &UtxoInput,
    group_internal_key: XOnlyPublicKey,
    denomination: u64,
    burn_config: &BurnConfig,
    pool_id: Digest32,
    fee: u64,
    change_script_pubkey: Option<ScriptBuf>,
    network: Network,
) -> Result<Psbt, PsbtError> {
    let secp = Secp256k1::verification_only();
    let group_address = Address::p2tr(&secp, group_internal_key, None, network);

    let burn_amount = burn_config.burn_amount(denomination);
    let required = denomination + burn_amount + fee;
    if input.amount < required {
        return Err(PsbtError::InsufficientInput {
            input: input.amount,
            required,
        });
    }
    let change = input.amount - required;

    let txid = Txid::from_str(&input.tx_id).map_err(|e| PsbtError::BadTxid(e.to_string()))?;
    let outpoint = OutPoint {
        txid,
        vout: input.output_index,
    };
    let witness_utxo = TxOut {
        value: Amount::from_sat(input.amount),
        script_pubkey: ScriptBuf::from_bytes(input.script_pubkey.clone()),
    };

    let mut outputs = vec![
        TxOut {
            value: Amount::from_sat(denomination),
            script_pubkey: group_address.script_pubkey(),
        },
        TxOut {
            value: Amount::from_sat(burn_amount),
            script_pubkey: build_burn_script(burn_config, pool_id),
        },
    ];
    if change > DUST_LIMIT_SATS {
        if let Some(script_pubkey) = change_script_pubkey {
            outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey,
            });
        }
    }
    if denomination < DUST_LIMIT_SATS {
        return Err(PsbtError::DustOutput { value: denomination });
    }

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: outputs,
    };

    let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|e| PsbtError::BadTxid(e.to_string()))?;
    psbt.inputs[0].witness_utxo = Some(witness_utxo);
    psbt.inputs[0].tap_internal_key = Some(group_internal_key);
    Ok(psbt)
}

/// A settlement transaction spending one shared Taproot output to the
/// rotation's destination address. The sighash of this transaction is the
/// MuSig2 signing message announced to the discovery layer.
pub fn build_settlement_tx(
    setup_tx_id: &str,
    output_index: u32,
    amount: u64,
    fee: u64,
    destination: &Address,
) -> Result<Transaction, PsbtError> {
    let txid = Txid::from_str(setup_tx_id).map_err(|e| PsbtError::BadTxid(e.to_string()))?;
    let send_amount = amount
        .checked_sub(fee)
        .ok_or(PsbtError::InsufficientInput { input: amount, required: fee })?;
    if send_amount < DUST_LIMIT_SATS {
        return Err(PsbtError::DustOutput { value: send_amount });
    }
    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid, vout: output_index },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(send_amount),
            script_pubkey: destination.script_pubkey(),
        }],
    })
}

/// BIP-341 key-path sighash for a settlement transaction's single input,
/// taken over the shared Taproot output it spends — this is the 32-byte
/// message the group's MuSig2 session signs.
pub fn settlement_sighash(
    tx: &Transaction,
    prevout: &TxOut,
) -> Result<[u8; 32], PsbtError> {
    use bitcoin::hashes::Hash as _;
    use bitcoin::sighash::{Prevouts, SighashCache};
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(0, &Prevouts::All(&[prevout.clone()]), bitcoin::TapSighashType::Default)
        .map_err(|e| PsbtError::BadTxid(e.to_string()))?;
    Ok(sighash.to_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{PublicKey, SecretKey};
    use swapsig_musig2::key_agg_tweaked;

    fn pubkey(seed: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let mut bytes = [0u8; 32];
        bytes[31] = seed;
        let sk = SecretKey::from_slice(&bytes).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    fn burn_config() -> BurnConfig {
        BurnConfig {
            burn_percentage: 0.001,
            minimum_burn: 500,
            maximum_burn: 10_000,
            burn_identifier: *b"SWPB",
            pool_id_in_burn: true,
            version: 1,
        }
    }

    #[test]
    fn setup_psbt_has_group_and_burn_outputs() {
        let (_, group_xonly) = key_agg_tweaked(&[pubkey(1), pubkey(2)]).unwrap();
        let input = UtxoInput {
            tx_id: "11".repeat(32),
            output_index: 0,
            amount: 2_000_000,
            script_pubkey: vec![0x51],
        };
        let pool_id = Digest32([7u8; 32]);
        let psbt = build_setup_psbt(
            &input,
            group_xonly,
            1_000_000,
            &burn_config(),
            pool_id,
            1_000,
            None,
            Network::Regtest,
        )
        .unwrap();
        assert_eq!(psbt.unsigned_tx.output.len(), 2);
        assert_eq!(psbt.unsigned_tx.output[0].value, Amount::from_sat(1_000_000));
        assert_eq!(psbt.unsigned_tx.output[1].value, Amount::from_sat(1_000));
    }

    #[test]
    fn setup_psbt_rejects_insufficient_input() {
        let (_, group_xonly) = key_agg_tweaked(&[pubkey(1), pubkey(2)]).unwrap();
        let input = UtxoInput {
            tx_id: "22".repeat(32),
            output_index: 0,
            amount: 500_000,
            script_pubkey: vec![0x51],
        };
        let result = build_setup_psbt(
            &input,
            group_xonly,
            1_000_000,
            &burn_config(),
            Digest32([1u8; 32]),
            1_000,
            None,
            Network::Regtest,
        );
        assert!(matches!(result, Err(PsbtError::InsufficientInput { .. })));
    }

    #[test]
    fn burn_script_starts_with_op_return() {
        let script = build_burn_script(&burn_config(), Digest32([3u8; 32]));
        assert!(script.is_op_return());
    }

    #[test]
    fn settlement_tx_pays_denomination_minus_fee() {
        let (_, group_xonly) = key_agg_tweaked(&[pubkey(1), pubkey(2)]).unwrap();
        let secp = Secp256k1::new();
        let dest = Address::p2tr(&secp, group_xonly, None, Network::Regtest);
        let tx = build_settlement_tx(&"33".repeat(32), 0, 1_000_000, 1_000, &dest).unwrap();
        assert_eq!(tx.output[0].value, Amount::from_sat(999_000));
    }
}

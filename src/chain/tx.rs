//! Legacy (EIP-155) transaction encoding and local signing.

use rlp::RlpStream;

use crate::chain::rpc::TransactionDraft;
use crate::crypto::keccak;
use crate::errors::BenchError;
use crate::wallet::Wallet;

fn append_uint(stream: &mut RlpStream, value: u128) {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|byte| *byte != 0).unwrap_or(16);
    stream.append(&bytes[first..].to_vec());
}

fn append_sig_word(stream: &mut RlpStream, word: &[u8]) {
    let first = word.iter().position(|byte| *byte != 0).unwrap_or(word.len());
    stream.append(&word[first..].to_vec());
}

/// RLP encoding of the unsigned transaction with the EIP-155 replay
/// protection fields `(chain_id, 0, 0)` appended.
pub fn encode_unsigned(draft: &TransactionDraft, chain_id: u64) -> Vec<u8> {
    let mut stream = RlpStream::new_list(9);
    append_uint(&mut stream, draft.nonce as u128);
    append_uint(&mut stream, draft.gas_price);
    append_uint(&mut stream, draft.gas as u128);
    match &draft.to {
        Some(to) => stream.append(&to.0.to_vec()),
        None => stream.append_empty_data(),
    };
    append_uint(&mut stream, draft.value);
    stream.append(&draft.data);
    append_uint(&mut stream, chain_id as u128);
    stream.append_empty_data();
    stream.append_empty_data();
    stream.out().to_vec()
}

/// Signs `draft` with the wallet's key and returns the raw transaction
/// bytes ready for `eth_sendRawTransaction`.
pub fn sign_transaction(
    draft: &TransactionDraft,
    chain_id: u64,
    wallet: &Wallet,
) -> Result<Vec<u8>, BenchError> {
    let digest = keccak(&encode_unsigned(draft, chain_id));
    let signature = wallet.sign_prehash(&digest)?;
    let recovery = u64::from(signature[64] - 27);
    let v = chain_id * 2 + 35 + recovery;

    let mut stream = RlpStream::new_list(9);
    append_uint(&mut stream, draft.nonce as u128);
    append_uint(&mut stream, draft.gas_price);
    append_uint(&mut stream, draft.gas as u128);
    match &draft.to {
        Some(to) => stream.append(&to.0.to_vec()),
        None => stream.append_empty_data(),
    };
    append_uint(&mut stream, draft.value);
    stream.append(&draft.data);
    append_uint(&mut stream, v as u128);
    append_sig_word(&mut stream, &signature[..32]);
    append_sig_word(&mut stream, &signature[32..64]);
    Ok(stream.out().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Address;

    // The worked example from the EIP-155 specification.
    fn eip155_example() -> TransactionDraft {
        TransactionDraft {
            from: Address::ZERO,
            to: Some("0x3535353535353535353535353535353535353535".parse().unwrap()),
            nonce: 9,
            value: 1_000_000_000_000_000_000,
            gas: 21_000,
            gas_price: 20_000_000_000,
            data: Vec::new(),
        }
    }

    #[test]
    fn unsigned_digest_matches_eip155_vector() {
        let digest = keccak(&encode_unsigned(&eip155_example(), 1));
        assert_eq!(
            hex::encode(digest),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn signed_transaction_matches_eip155_vector() {
        let wallet = Wallet::new(
            None,
            Some("4646464646464646464646464646464646464646464646464646464646464646"),
        )
        .unwrap();
        let raw = sign_transaction(&eip155_example(), 1, &wallet).unwrap();
        assert_eq!(
            hex::encode(raw),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0\
             b6b3a764000080\
             25a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067\
             cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
    }

    #[test]
    fn contract_creation_has_empty_to() {
        let mut draft = eip155_example();
        draft.to = None;
        draft.data = vec![0x60, 0x60];
        let encoded = encode_unsigned(&draft, 1337);
        // An empty `to` encodes as the single byte 0x80 inside the list.
        assert!(encoded.len() > 8);
    }
}

//! Contract ABI descriptors.
//!
//! The factory and escrow interfaces are the static JSON documents bundled
//! under `abi/`, parsed with `alloy-json-abi`. Calls are encoded and results
//! decoded through `alloy-dyn-abi`, so any Solidity type in those documents is
//! supported without per-function code.

use crate::error::{EscrowError, EscrowResult};
use crate::types::is_address;
use alloy_dyn_abi::{DynSolValue, EventExt, FunctionExt, JsonAbiExt, Specifier};
use alloy_json_abi::{Event, Function, JsonAbi, StateMutability};
use alloy_primitives::{Address, B256, U256};

pub use alloy_primitives::keccak256;

pub const ESCROW_FACTORY_ABI_JSON: &str = include_str!("../abi/escrow_factory.json");
pub const ESCROW_ABI_JSON: &str = include_str!("../abi/escrow.json");

pub fn to_hex_prefixed(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn from_hex_prefixed(value: &str) -> EscrowResult<Vec<u8>> {
    let trimmed = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(trimmed).map_err(|e| EscrowError::Abi(format!("invalid hex '{}': {}", value, e)))
}

pub fn parse_address(value: &str) -> EscrowResult<Address> {
    let value = value.trim();
    if !is_address(value) {
        return Err(EscrowError::Abi(format!("'{}' is not a 20-byte address", value)));
    }
    value
        .parse::<Address>()
        .map_err(|e| EscrowError::Abi(format!("'{}' is not an address: {}", value, e)))
}

/// Lowercase `0x`-prefixed form used for record keys and display.
pub fn format_address(address: &Address) -> String {
    to_hex_prefixed(address.as_slice())
}

pub fn address_value(value: &str) -> EscrowResult<DynSolValue> {
    parse_address(value).map(DynSolValue::Address)
}

pub fn value_address(value: &DynSolValue) -> Option<String> {
    value.as_address().map(|address| format_address(&address))
}

pub fn value_uint(value: &DynSolValue) -> Option<U256> {
    value.as_uint().map(|(number, _)| number)
}

fn abi_error(context: &str, err: alloy_dyn_abi::Error) -> EscrowError {
    EscrowError::Abi(format!("{}: {}", context, err))
}

/// Encoding helpers on top of the alloy function model.
pub trait FunctionCodec {
    fn is_read_only(&self) -> bool;

    /// Check argument count and types without encoding.
    fn check_args(&self, args: &[DynSolValue]) -> EscrowResult<()>;

    /// Selector followed by the encoded arguments.
    fn encode_call(&self, args: &[DynSolValue]) -> EscrowResult<Vec<u8>>;

    /// Decode full calldata, selector included.
    fn decode_input(&self, calldata: &[u8]) -> EscrowResult<Vec<DynSolValue>>;

    fn encode_output(&self, values: &[DynSolValue]) -> EscrowResult<Vec<u8>>;

    fn decode_output(&self, data: &[u8]) -> EscrowResult<Vec<DynSolValue>>;
}

impl FunctionCodec for Function {
    fn is_read_only(&self) -> bool {
        matches!(
            self.state_mutability,
            StateMutability::View | StateMutability::Pure
        )
    }

    fn check_args(&self, args: &[DynSolValue]) -> EscrowResult<()> {
        if args.len() != self.inputs.len() {
            return Err(EscrowError::Abi(format!(
                "{} expects {} argument(s), got {}",
                self.signature(),
                self.inputs.len(),
                args.len()
            )));
        }
        for (index, (param, value)) in self.inputs.iter().zip(args).enumerate() {
            let expected = param
                .resolve()
                .map_err(|e| abi_error(&self.signature(), e))?;
            if !expected.matches(value) {
                return Err(EscrowError::Abi(format!(
                    "argument {} of {} must be {}, got {:?}",
                    index,
                    self.signature(),
                    param.ty,
                    value
                )));
            }
        }
        Ok(())
    }

    fn encode_call(&self, args: &[DynSolValue]) -> EscrowResult<Vec<u8>> {
        self.check_args(args)?;
        self.abi_encode_input(args)
            .map_err(|e| abi_error(&self.signature(), e))
    }

    fn decode_input(&self, calldata: &[u8]) -> EscrowResult<Vec<DynSolValue>> {
        if calldata.len() < 4 || calldata[..4] != self.selector()[..] {
            return Err(EscrowError::Abi(format!(
                "calldata does not target {}",
                self.signature()
            )));
        }
        self.abi_decode_input(&calldata[4..], true)
            .map_err(|e| abi_error(&self.signature(), e))
    }

    fn encode_output(&self, values: &[DynSolValue]) -> EscrowResult<Vec<u8>> {
        self.abi_encode_output(values)
            .map_err(|e| abi_error(&self.signature(), e))
    }

    fn decode_output(&self, data: &[u8]) -> EscrowResult<Vec<DynSolValue>> {
        self.abi_decode_output(data, true)
            .map_err(|e| abi_error(&format!("return data of {}", self.signature()), e))
    }
}

/// Parsed ABI document for one contract.
#[derive(Debug, Clone)]
pub struct AbiDescriptor {
    name: String,
    abi: JsonAbi,
}

impl AbiDescriptor {
    pub fn from_json(name: impl Into<String>, json: &str) -> EscrowResult<Self> {
        let name = name.into();
        let abi: JsonAbi = serde_json::from_str(json)
            .map_err(|e| EscrowError::Abi(format!("{} ABI is not valid JSON: {}", name, e)))?;
        Ok(Self { name, abi })
    }

    pub fn escrow_factory() -> EscrowResult<Self> {
        Self::from_json("EscrowFactory", ESCROW_FACTORY_ABI_JSON)
    }

    pub fn escrow() -> EscrowResult<Self> {
        Self::from_json("Escrow", ESCROW_ABI_JSON)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// First definition of `name`; the escrow contracts have no overloads.
    pub fn function(&self, name: &str) -> EscrowResult<&Function> {
        self.abi
            .function(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| {
                EscrowError::Abi(format!("{} ABI has no function '{}'", self.name, name))
            })
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.abi.functions()
    }

    pub fn event(&self, name: &str) -> EscrowResult<&Event> {
        self.abi
            .event(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| EscrowError::Abi(format!("{} ABI has no event '{}'", self.name, name)))
    }

    /// Find the function whose selector prefixes `calldata`.
    pub fn function_for_calldata(&self, calldata: &[u8]) -> Option<&Function> {
        let selector = calldata.get(..4)?;
        self.abi
            .functions()
            .find(|function| function.selector()[..] == *selector)
    }

    /// Decode a log emitted as event `name`.
    ///
    /// Values come back in declaration order, indexed and non-indexed
    /// parameters interleaved as the event declares them.
    pub fn decode_log(
        &self,
        name: &str,
        topics: &[B256],
        data: &[u8],
    ) -> EscrowResult<Vec<DynSolValue>> {
        let event = self.event(name)?;
        if !event.anonymous && topics.first() != Some(&event.selector()) {
            return Err(EscrowError::Abi(format!(
                "log is not a {} event",
                event.signature()
            )));
        }
        let decoded = event
            .decode_log_parts(topics.iter().copied(), data, true)
            .map_err(|e| abi_error(&event.signature(), e))?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        event
            .inputs
            .iter()
            .map(|input| {
                if input.indexed {
                    indexed.next()
                } else {
                    body.next()
                }
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                EscrowError::Abi(format!("{} log is missing parameters", event.signature()))
            })
    }

    /// Topics and data of event `name` carrying `values` in declaration order.
    pub fn encode_log(&self, name: &str, values: &[DynSolValue]) -> EscrowResult<(Vec<B256>, Vec<u8>)> {
        let event = self.event(name)?;
        if values.len() != event.inputs.len() {
            return Err(EscrowError::Abi(format!(
                "{} expects {} value(s), got {}",
                event.signature(),
                event.inputs.len(),
                values.len()
            )));
        }

        let mut topics = Vec::new();
        if !event.anonymous {
            topics.push(event.selector());
        }
        let mut body = Vec::new();
        for (input, value) in event.inputs.iter().zip(values) {
            if !input.indexed {
                body.push(value.clone());
                continue;
            }
            match value {
                DynSolValue::Address(address) => topics.push(address.into_word()),
                DynSolValue::Uint(number, _) => topics.push(B256::from(number.to_be_bytes::<32>())),
                DynSolValue::FixedBytes(word, _) => topics.push(*word),
                DynSolValue::Bool(flag) => {
                    topics.push(B256::from(U256::from(u8::from(*flag)).to_be_bytes::<32>()))
                }
                other => topics.push(keccak256(other.abi_encode_packed())),
            }
        }
        Ok((topics, DynSolValue::Tuple(body).abi_encode_params()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ERC20_TRANSFER: &str = r#"[
        {"type":"function","name":"transfer","stateMutability":"nonpayable",
         "inputs":[{"name":"to","type":"address"},{"name":"amount","type":"uint256"}],
         "outputs":[{"name":"","type":"bool"}]},
        {"type":"event","name":"Transfer","anonymous":false,"inputs":[]}
    ]"#;

    fn addr(value: &str) -> DynSolValue {
        address_value(value).unwrap()
    }

    #[test]
    fn selector_matches_known_erc20_transfer() {
        let abi = AbiDescriptor::from_json("ERC20", ERC20_TRANSFER).unwrap();
        let transfer = abi.function("transfer").unwrap();
        assert_eq!(transfer.signature(), "transfer(address,uint256)");
        assert_eq!(hex::encode(transfer.selector()), "a9059cbb");
    }

    #[test]
    fn events_are_not_functions() {
        let abi = AbiDescriptor::from_json("ERC20", ERC20_TRANSFER).unwrap();
        assert_eq!(abi.functions().count(), 1);
        assert!(abi.function("Transfer").is_err());
        assert!(abi.event("Transfer").is_ok());
    }

    #[test]
    fn encodes_static_arguments_as_words() {
        let abi = AbiDescriptor::from_json("ERC20", ERC20_TRANSFER).unwrap();
        let transfer = abi.function("transfer").unwrap();
        let data = transfer
            .encode_call(&[
                addr("0x00000000000000000000000000000000000000aa"),
                DynSolValue::Uint(U256::from(5u8), 256),
            ])
            .unwrap();

        assert_eq!(data.len(), 4 + 64);
        assert_eq!(data[4 + 31], 0xaa);
        assert_eq!(data[4 + 63], 5);
        assert!(data[4..4 + 31].iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_wrong_arity_and_types() {
        let abi = AbiDescriptor::from_json("ERC20", ERC20_TRANSFER).unwrap();
        let transfer = abi.function("transfer").unwrap();
        let one = DynSolValue::Uint(U256::from(1u8), 256);
        assert!(transfer.encode_call(&[one.clone()]).is_err());
        let err = transfer.encode_call(&[one.clone(), one]).unwrap_err();
        assert!(err.to_string().contains("must be address"));
    }

    #[test]
    fn rejects_malformed_address() {
        let err = address_value("0xABC...").unwrap_err();
        assert!(matches!(err, EscrowError::Abi(_)));
    }

    #[test]
    fn addresses_are_lowercased_for_display() {
        let value = addr("0xABCDEF0000000000000000000000000000000001");
        assert_eq!(
            value_address(&value).as_deref(),
            Some("0xabcdef0000000000000000000000000000000001")
        );
    }

    #[test]
    fn calldata_decodes_back_to_arguments() {
        let abi = AbiDescriptor::escrow_factory().unwrap();
        let create = abi.function("createProxy").unwrap();
        let args = vec![
            addr("0x1111111111111111111111111111111111111111"),
            addr("0x2222222222222222222222222222222222222222"),
            addr("0x3333333333333333333333333333333333333333"),
        ];
        let calldata = create.encode_call(&args).unwrap();

        assert_eq!(abi.function_for_calldata(&calldata), Some(create));
        assert_eq!(create.decode_input(&calldata).unwrap(), args);
        assert!(create.decode_input(&calldata[..3]).is_err());
    }

    #[test]
    fn balances_beyond_u128_survive_decoding() {
        let abi = AbiDescriptor::escrow().unwrap();
        let balance = abi.function("approvedBalance").unwrap();
        let large = U256::from(u128::MAX) * U256::from(1_000u32);
        let encoded = balance
            .encode_output(&[DynSolValue::Uint(large, 256)])
            .unwrap();
        let decoded = balance.decode_output(&encoded).unwrap();
        assert_eq!(value_uint(&decoded[0]), Some(large));
    }

    #[test]
    fn short_return_data_is_an_error() {
        let abi = AbiDescriptor::escrow().unwrap();
        let payer = abi.function("payer").unwrap();
        assert!(payer.decode_output(&[0u8; 12]).is_err());
    }

    #[test]
    fn oversized_string_offset_is_an_error() {
        let abi = AbiDescriptor::escrow().unwrap();
        let asset_uri = abi.function("assetURI").unwrap();

        let mut data = vec![0u8; 64];
        data[24..32].copy_from_slice(&u64::MAX.to_be_bytes());
        let err = asset_uri.decode_output(&data).unwrap_err();
        assert!(matches!(err, EscrowError::Abi(_)));

        let mut data = vec![0u8; 64];
        data[31] = 32;
        data[56..64].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(asset_uri.decode_output(&data).is_err());
    }

    #[test]
    fn proxy_created_log_round_trips() {
        let abi = AbiDescriptor::escrow_factory().unwrap();
        let values = vec![
            addr("0x9e3f000000000000000000000000000000000ea0"),
            addr("0x1230000000000000000000000000000000000123"),
        ];
        let (topics, data) = abi.encode_log("ProxyCreated", &values).unwrap();
        assert_eq!(topics.len(), 3);
        assert_eq!(topics[0], abi.event("ProxyCreated").unwrap().selector());
        assert_eq!(abi.decode_log("ProxyCreated", &topics, &data).unwrap(), values);

        let foreign = [B256::ZERO, topics[1], topics[2]];
        assert!(abi.decode_log("ProxyCreated", &foreign, &data).is_err());
    }

    #[test]
    fn bundled_escrow_abi_exposes_reads_and_approve() {
        let abi = AbiDescriptor::escrow().unwrap();
        assert!(!abi.function("approve").unwrap().is_read_only());
        for read in ["payer", "beneficiary", "judge", "status", "approvedBalance", "assetURI"] {
            assert!(abi.function(read).unwrap().is_read_only(), "{read}");
        }
    }
}

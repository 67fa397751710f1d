use data_encoding::{Encoding, Specification, SpecificationError};

/// RFC 4648 Base32 アルファベット（認証アプリ互換）
pub const ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// TOTPシークレット用 Base32 コーデック
///
/// - エンコード: パディングなし
/// - デコード: 大文字小文字を区別せず、アルファベット外の文字（空白、`-`、`=` など）は読み飛ばす。
///   8ビットに満たない末尾のビットは捨てる
#[derive(Clone)]
pub struct Base32Codec {
    encoding: Encoding,
}

impl Base32Codec {
    pub fn new() -> Result<Self, SpecificationError> {
        let mut spec = Specification::new();
        spec.symbols.push_str(ALPHABET);
        // 末尾の余りビットは検証しない（切り捨てた不完全グループを許容）
        spec.check_trailing_bits = false;

        Ok(Self {
            encoding: spec.encoding()?,
        })
    }

    pub fn encode(&self, bytes: &[u8]) -> String {
        self.encoding.encode(bytes)
    }

    /// 寛容デコード
    ///
    /// # Note
    /// エラーは返さない。不正な入力は短いバイト列になるため、長さの検証は呼び出し側で行う
    pub fn decode(&self, input: &str) -> Vec<u8> {
        let mut symbols: String = input
            .chars()
            .map(|c| c.to_ascii_uppercase())
            .filter(|c| ALPHABET.contains(*c))
            .collect();

        // 完全なバイトを構成できるシンボル数まで切り詰める
        let byte_len = symbols.len() * 5 / 8;
        symbols.truncate((byte_len * 8).div_ceil(5));

        self.encoding
            .decode(symbols.as_bytes())
            .unwrap_or_default()
    }
}

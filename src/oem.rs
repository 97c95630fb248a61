//! OEM character set conversion.
//!
//! NTLM transports some strings (the NEGOTIATE domain and workstation, the LM password) in the
//! "OEM" character set of the client. Windows exposes the configured OEM code page through the
//! code page conversion functions; other operating systems have no such concept and practically
//! always run on UTF-8, so that is what we use there.


#[cfg(windows)]
mod imp {
    use windows::Win32::Globalization::{
        CP_OEMCP, MB_ERR_INVALID_CHARS, MB_PRECOMPOSED, MultiByteToWideChar, WC_COMPOSITECHECK,
        WideCharToMultiByte,
    };

    /// Runs a Win32 conversion function twice: once to measure, once to fill the buffer.
    fn measure_and_fill<T: Copy + Default>(mut call: impl FnMut(Option<&mut [T]>) -> i32) -> Option<Vec<T>> {
        let needed: usize = call(None).try_into().ok()?;
        if needed == 0 {
            return None;
        }
        let mut buf = vec![T::default(); needed];
        let written: usize = call(Some(buf.as_mut_slice())).try_into().ok()?;
        if written == 0 {
            return None;
        }
        buf.truncate(written);
        Some(buf)
    }

    pub fn encode(text: &str) -> Option<Vec<u8>> {
        if text.is_empty() {
            return Some(Vec::new());
        }
        let wide: Vec<u16> = text.encode_utf16().collect();
        measure_and_fill(|out| unsafe {
            WideCharToMultiByte(CP_OEMCP, WC_COMPOSITECHECK, &wide, out, None, None)
        })
    }

    pub fn decode(bytes: &[u8]) -> Option<String> {
        if bytes.is_empty() {
            return Some(String::new());
        }
        let wide = measure_and_fill(|out| unsafe {
            MultiByteToWideChar(CP_OEMCP, MB_ERR_INVALID_CHARS | MB_PRECOMPOSED, bytes, out)
        })?;
        String::from_utf16(&wide).ok()
    }
}

#[cfg(not(windows))]
mod imp {
    pub fn encode(text: &str) -> Option<Vec<u8>> {
        Some(text.as_bytes().to_vec())
    }

    pub fn decode(bytes: &[u8]) -> Option<String> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}


/// Encodes a string in the OEM character set, or returns `None` if it is not representable.
pub(crate) fn encode(text: &str) -> Option<Vec<u8>> {
    imp::encode(text)
}

/// Decodes an OEM-encoded byte string, or returns `None` if it is not valid in that encoding.
pub(crate) fn decode(bytes: &[u8]) -> Option<String> {
    imp::decode(bytes)
}

use crate::address::Address;
use crate::error::{Error, NetResult};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::net::ToSocketAddrs;
use std::sync::Mutex;

lazy_static! {
    static ref LOOKUP_CACHE: Mutex<HashMap<String, Vec<Address>>> = Mutex::new(HashMap::new());
}

/// Resolves `<host>:<port>` notation, consulting a process-wide cache first. Numeric addresses
/// bypass the resolver entirely.
pub fn resolve(text: &str) -> NetResult<Vec<Address>> {
    if let Ok(address) = Address::parse(text) {
        return Ok(vec![address]);
    }

    {
        let cache = LOOKUP_CACHE.lock().expect("Lookup cache poisoned");
        if let Some(found) = cache.get(text) {
            return Ok(found.clone());
        }
    }

    let resolved: Vec<Address> = text
        .to_socket_addrs()
        .map_err(|_| Error::AddrParse)?
        .map(Address::from)
        .collect();

    if resolved.is_empty() {
        return Err(Error::AddrParse);
    }

    LOOKUP_CACHE
        .lock()
        .expect("Lookup cache poisoned")
        .insert(text.to_owned(), resolved.clone());

    Ok(resolved)
}

/// First address for `<host>:<port>` notation.
pub fn resolve_one(text: &str) -> NetResult<Address> {
    Ok(resolve(text)?[0])
}

/// Drops all cached lookups.
pub fn clear_cache() {
    LOOKUP_CACHE.lock().expect("Lookup cache poisoned").clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_resolution() {
        let found = resolve_one("127.0.0.1:2020").unwrap();
        assert_eq!(found, Address::parse("127.0.0.1:2020").unwrap());
    }

    #[test]
    fn test_resolution_failure() {
        assert!(resolve("definitely not an address").is_err());
    }

    #[test]
    fn test_localhost_resolution_is_cached() {
        let first = resolve("localhost:9000").unwrap();
        let second = resolve("localhost:9000").unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].port(), 9000);
    }
}

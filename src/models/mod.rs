pub mod account;
pub mod appointment;
pub mod enums;
pub mod notification;
pub mod otp;

pub use account::*;
pub use appointment::*;
pub use enums::*;
pub use notification::*;
pub use otp::*;

use serde::Deserialize;

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Zero-based page selector for list projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    pub fn is_valid(&self) -> bool {
        (1..=MAX_PAGE_SIZE).contains(&self.size)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.size)
    }

    pub fn total_pages(&self, total: u64) -> u32 {
        if self.size == 0 {
            return 0;
        }
        let pages = total.div_ceil(u64::from(self.size));
        u32::try_from(pages).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_page_is_first_ten() {
        let page: PageRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(page, PageRequest::new(0, 10));
        assert!(page.is_valid());
    }

    #[test]
    fn size_bounds() {
        assert!(!PageRequest::new(0, 0).is_valid());
        assert!(PageRequest::new(0, 100).is_valid());
        assert!(!PageRequest::new(0, 101).is_valid());
    }

    #[test]
    fn total_pages_rounds_up() {
        let page = PageRequest::new(2, 10);
        assert_eq!(page.offset(), 20);
        assert_eq!(page.total_pages(0), 0);
        assert_eq!(page.total_pages(10), 1);
        assert_eq!(page.total_pages(11), 2);
    }
}

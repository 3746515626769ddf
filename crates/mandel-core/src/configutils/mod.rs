//! Building blocks of the user-config pipeline.

mod archive;
mod browser;
mod crypto;
mod gzip;

pub use archive::{compress_dir, extract_archive};
pub use browser::{
    deserialize_bookmarks, merge_extensions, saved_extensions, update_saved_extensions,
    write_browser_data, Bookmark, Bookmarks, BrowserData, BROWSER_DATA_FILENAME,
    SAVED_EXTENSIONS_FILENAME,
};
pub use crypto::{decrypt, encrypt};
pub use gzip::{gzip_deflate_string, gzip_inflate_string};

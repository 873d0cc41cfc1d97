mod hexdump;
mod properties;

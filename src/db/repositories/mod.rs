mod readings;
mod watches;
